//! Reactive bridge between a Kafka consumer and application code: a
//! dedicated event loop serializes all consumer access (polls, heartbeats,
//! offset commits, rebalances, shutdown) and exposes the records as a
//! back-pressured stream with explicit acknowledgement and commit handles.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics_const;
pub mod offsets;
pub mod receiver;
pub mod types;

mod event_loop;
mod shared;

pub use config::{AckMode, ConsumerConfig, KafkaConfig, ReceiverOptions, Subscription};
pub use context::{RebalanceListener, SeekablePartition};
pub use error::{PayloadError, ReceiverError};
pub use offsets::{CommitFuture, CommittableOffset};
pub use receiver::{CloseHandle, KafkaReceiver, ReceiverRecord, RecordStream};
pub use shared::ReceiverState;
pub use types::TopicPartition;
