use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

/// Errors surfaced by the receiver, either as the terminal item of the
/// record stream or through a commit completion signal.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("offset commit failed: {0}")]
    Commit(RDKafkaErrorCode),

    #[error("offset commit failed {attempts} consecutive times, giving up: {code}")]
    CommitRetriesExhausted { attempts: u32, code: RDKafkaErrorCode },

    #[error("rebalance listener failed: {0}")]
    Listener(String),

    #[error("receiver closed")]
    Closed,

    #[error("failed to start receiver event loop: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the typed payload accessor on a received record.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("received empty payload")]
    Empty,
}

/// Commit errors the broker may resolve on its own once the group settles or
/// the coordinator comes back; auto-ack modes retry these.
pub(crate) fn commit_error_is_retriable(error: &KafkaError) -> bool {
    let Some(code) = error.rdkafka_error_code() else {
        return false;
    };
    matches!(
        code,
        RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::AllBrokersDown
    )
}

pub(crate) fn commit_error_code(error: &KafkaError) -> RDKafkaErrorCode {
    error
        .rdkafka_error_code()
        .unwrap_or(RDKafkaErrorCode::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalance_in_progress_is_retriable() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress);
        assert!(commit_error_is_retriable(&err));
    }

    #[test]
    fn unknown_member_is_not_retriable() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::UnknownMemberId);
        assert!(!commit_error_is_retriable(&err));
        assert_eq!(
            commit_error_code(&err),
            RDKafkaErrorCode::UnknownMemberId
        );
    }
}
