use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::ClientContext;
use tracing::{debug, error, info, warn};

use crate::config::AckMode;
use crate::metrics_const::{PARTITIONS_ASSIGNED_COUNTER, PARTITIONS_REVOKED_COUNTER};
use crate::shared::{Feedback, ReceiverShared};
use crate::types::TopicPartition;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks invoked when the group assigns or revokes partitions. Both run
/// on the event-loop thread, inside the consumer's poll, so they may use the
/// provided [`SeekablePartition`]s; an error fails the record stream.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &[SeekablePartition<'_>]) -> anyhow::Result<()> {
        let _ = partitions;
        Ok(())
    }

    fn on_partitions_revoked(&self, partitions: &[SeekablePartition<'_>]) -> anyhow::Result<()> {
        let _ = partitions;
        Ok(())
    }
}

/// Capability handle for repositioning one partition during a rebalance
/// callback. Borrows the consumer, so it cannot outlive the callback.
pub struct SeekablePartition<'a> {
    consumer: &'a BaseConsumer<ReceiverContext>,
    partition: TopicPartition,
}

impl<'a> SeekablePartition<'a> {
    fn new(consumer: &'a BaseConsumer<ReceiverContext>, partition: TopicPartition) -> Self {
        Self { consumer, partition }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn seek(&self, offset: i64) -> KafkaResult<()> {
        self.consumer.seek(
            self.partition.topic(),
            self.partition.partition(),
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )
    }

    pub fn seek_to_beginning(&self) -> KafkaResult<()> {
        self.consumer.seek(
            self.partition.topic(),
            self.partition.partition(),
            Offset::Beginning,
            SEEK_TIMEOUT,
        )
    }

    pub fn seek_to_end(&self) -> KafkaResult<()> {
        self.consumer.seek(
            self.partition.topic(),
            self.partition.partition(),
            Offset::End,
            SEEK_TIMEOUT,
        )
    }

    /// The next offset that will be fetched for this partition, if one has
    /// been established yet.
    pub fn position(&self) -> KafkaResult<Option<i64>> {
        let positions = self.consumer.position()?;
        Ok(positions
            .find_partition(self.partition.topic(), self.partition.partition())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }
}

/// Consumer context bridging librdkafka's callbacks back into the receiver:
/// partition revocation forces a commit of everything acknowledged so far,
/// user listeners run inside the rebalance, and async commit results are
/// queued for the event loop.
pub struct ReceiverContext {
    shared: Arc<ReceiverShared>,
    listeners: Vec<Arc<dyn RebalanceListener>>,
}

impl ReceiverContext {
    pub(crate) fn new(
        shared: Arc<ReceiverShared>,
        listeners: Vec<Arc<dyn RebalanceListener>>,
    ) -> Self {
        Self { shared, listeners }
    }

    /// Flushes acknowledged offsets synchronously before the group takes the
    /// partitions away. Runs on the loop thread inside the poll that
    /// triggered the rebalance.
    fn commit_before_revoke(&self, consumer: &BaseConsumer<ReceiverContext>) {
        if !self.shared.take_commit_pending(true) {
            return;
        }
        let args = self.shared.lock_batch().snapshot_and_clear();
        if args.is_empty() {
            args.resolve(|| Ok(()));
            return;
        }
        let tpl = match args.to_tpl() {
            Ok(tpl) => tpl,
            Err(err) => {
                error!(error = %err, "failed to build commit list ahead of revoke");
                self.shared.lock_batch().restore(args, true);
                return;
            }
        };
        match consumer.commit(&tpl, rdkafka::consumer::CommitMode::Sync) {
            Ok(()) => {
                info!(
                    partitions = args.len(),
                    "committed offsets ahead of partition revoke"
                );
                args.resolve(|| Ok(()));
            }
            Err(err) => {
                warn!(error = %err, "commit ahead of partition revoke failed, offsets restored");
                self.shared.lock_batch().restore(args, true);
            }
        }
    }

    fn run_listeners<F>(&self, partitions: &[SeekablePartition<'_>], invoke: F)
    where
        F: Fn(&dyn RebalanceListener, &[SeekablePartition<'_>]) -> anyhow::Result<()>,
    {
        for listener in &self.listeners {
            if let Err(err) = invoke(listener.as_ref(), partitions) {
                error!(error = %err, "rebalance listener failed");
                self.shared
                    .push_feedback(Feedback::ListenerError(format!("{err:#}")));
                return;
            }
        }
    }

    pub(crate) fn wrap_partitions<'a>(
        consumer: &'a BaseConsumer<ReceiverContext>,
        tpl: &TopicPartitionList,
    ) -> Vec<SeekablePartition<'a>> {
        tpl.elements()
            .iter()
            .map(|elem| {
                SeekablePartition::new(
                    consumer,
                    TopicPartition::new(elem.topic(), elem.partition()),
                )
            })
            .collect()
    }
}

impl ClientContext for ReceiverContext {}

impl ConsumerContext for ReceiverContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            debug!(partitions = tpl.count(), "partitions being revoked");
            metrics::counter!(PARTITIONS_REVOKED_COUNTER).increment(tpl.count() as u64);
            if self.shared.ack_mode() != AckMode::AtMostOnce {
                self.commit_before_revoke(consumer);
            }
            let partitions = Self::wrap_partitions(consumer, tpl);
            self.run_listeners(&partitions, |listener, partitions| {
                listener.on_partitions_revoked(partitions)
            });
        }
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                debug!(partitions = tpl.count(), "partitions assigned");
                metrics::counter!(PARTITIONS_ASSIGNED_COUNTER).increment(tpl.count() as u64);
                let partitions = Self::wrap_partitions(consumer, tpl);
                self.run_listeners(&partitions, |listener, partitions| {
                    listener.on_partitions_assigned(partitions)
                });
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => {
                error!(error = %err, "rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match &result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            Err(err) => warn!(error = %err, "async offset commit failed"),
        }
        self.shared.push_feedback(Feedback::CommitResult(result));
    }
}
