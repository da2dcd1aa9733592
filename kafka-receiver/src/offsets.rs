use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::task::{Context, Poll};

use rdkafka::error::KafkaResult;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::oneshot;

use crate::config::AckMode;
use crate::error::ReceiverError;
use crate::shared::ReceiverShared;
use crate::types::TopicPartition;

pub(crate) type CommitNotifier = oneshot::Sender<Result<(), ReceiverError>>;

/// Accumulates the highest acknowledged offset per partition between two
/// flushes, together with the completion notifiers registered for the next
/// flush. Always accessed under the receiver's batch mutex.
#[derive(Default)]
pub(crate) struct CommittableBatch {
    latest: HashMap<TopicPartition, i64>,
    notifiers: Vec<CommitNotifier>,
}

impl CommittableBatch {
    /// Records `offset` as the highest acknowledged offset for `partition`
    /// and returns the number of partitions with a pending update. Offsets
    /// never move backwards between flushes.
    pub fn update_offset(&mut self, partition: &TopicPartition, offset: i64) -> usize {
        match self.latest.entry(partition.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() < offset {
                    entry.insert(offset);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(offset);
            }
        }
        self.latest.len()
    }

    pub fn add_notifier(&mut self, notifier: CommitNotifier) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Atomically takes everything accumulated so far, leaving the batch
    /// empty for subsequent acknowledgements.
    pub fn snapshot_and_clear(&mut self) -> CommitArgs {
        CommitArgs {
            offsets: std::mem::take(&mut self.latest),
            notifiers: std::mem::take(&mut self.notifiers),
        }
    }

    /// Puts a failed snapshot back, keeping any offset that was re-acked in
    /// the meantime (a present entry is always newer than the snapshot).
    /// Returns the notifiers that were not re-registered so the caller can
    /// resolve them.
    pub fn restore(&mut self, args: CommitArgs, restore_notifiers: bool) -> Vec<CommitNotifier> {
        for (partition, offset) in args.offsets {
            self.latest.entry(partition).or_insert(offset);
        }
        if restore_notifiers {
            self.notifiers.extend(args.notifiers);
            Vec::new()
        } else {
            args.notifiers
        }
    }
}

/// One flush worth of work: the offsets to commit and the notifiers to
/// resolve once the commit settles.
#[derive(Default)]
pub(crate) struct CommitArgs {
    pub offsets: HashMap<TopicPartition, i64>,
    pub notifiers: Vec<CommitNotifier>,
}

impl CommitArgs {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Builds the commit list, re-encoding each stored offset as the next
    /// offset to consume (Kafka's commit convention).
    pub fn to_tpl(&self) -> KafkaResult<TopicPartitionList> {
        let mut tpl = TopicPartitionList::with_capacity(self.offsets.len());
        for (partition, &offset) in &self.offsets {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition(),
                Offset::Offset(offset + 1),
            )?;
        }
        Ok(tpl)
    }

    pub fn resolve(self, result: impl Fn() -> Result<(), ReceiverError>) {
        for notifier in self.notifiers {
            drop(notifier.send(result()));
        }
    }
}

/// Per-record handle offering acknowledge and commit operations against the
/// receiver's committable batch. The receiver side is held weakly, so using
/// a handle after the receiver closed is a no-op (acknowledge) or resolves
/// with [`ReceiverError::Closed`] (commit).
#[derive(Debug)]
pub struct CommittableOffset {
    partition: TopicPartition,
    offset: i64,
    ack_mode: AckMode,
    acknowledged: AtomicBool,
    shared: Weak<ReceiverShared>,
}

impl CommittableOffset {
    pub(crate) fn new(
        partition: TopicPartition,
        offset: i64,
        ack_mode: AckMode,
        acknowledged: bool,
        shared: Weak<ReceiverShared>,
    ) -> Self {
        Self {
            partition,
            offset,
            ack_mode,
            acknowledged: AtomicBool::new(acknowledged),
            shared,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// The record's offset. The value committed for it is `offset + 1`.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Marks the record as processed. Idempotent: a single offset
    /// contributes at most once to the batch. Depending on the ack mode this
    /// may trigger a flush once the batch reaches the configured size.
    pub fn acknowledge(&self) {
        if self.ack_mode == AckMode::AtMostOnce {
            // Already committed before the record was delivered.
            return;
        }
        if self.acknowledged.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.acknowledge(&self.partition, self.offset);
    }

    /// Acknowledges the record (if not already done) and schedules an
    /// immediate flush of the batch. The returned future resolves when the
    /// flush containing this offset settles.
    pub fn commit(&self) -> CommitFuture {
        if self.ack_mode == AckMode::AtMostOnce {
            return CommitFuture::ready(Ok(()));
        }
        let Some(shared) = self.shared.upgrade() else {
            return CommitFuture::ready(Err(ReceiverError::Closed));
        };
        let newly_acknowledged = !self.acknowledged.swap(true, Ordering::SeqCst);
        let receiver = {
            let mut batch = shared.lock_batch();
            if !newly_acknowledged && batch.is_empty() {
                // Nothing left to flush for this offset.
                return CommitFuture::ready(Ok(()));
            }
            if newly_acknowledged {
                batch.update_offset(&self.partition, self.offset);
            }
            let (tx, rx) = oneshot::channel();
            batch.add_notifier(tx);
            rx
        };
        shared.schedule_commit();
        CommitFuture::pending(receiver)
    }
}

/// One-shot completion signal for [`CommittableOffset::commit`].
#[derive(Debug)]
pub struct CommitFuture {
    inner: CommitFutureInner,
}

#[derive(Debug)]
enum CommitFutureInner {
    Ready(Option<Result<(), ReceiverError>>),
    Pending(oneshot::Receiver<Result<(), ReceiverError>>),
}

impl CommitFuture {
    fn ready(result: Result<(), ReceiverError>) -> Self {
        Self {
            inner: CommitFutureInner::Ready(Some(result)),
        }
    }

    fn pending(receiver: oneshot::Receiver<Result<(), ReceiverError>>) -> Self {
        Self {
            inner: CommitFutureInner::Pending(receiver),
        }
    }
}

impl Future for CommitFuture {
    type Output = Result<(), ReceiverError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            CommitFutureInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(ReceiverError::Closed)))
            }
            CommitFutureInner::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // The receiver went away without resolving the commit.
                Poll::Ready(Err(_)) => Poll::Ready(Err(ReceiverError::Closed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(n: i32) -> TopicPartition {
        TopicPartition::new("events", n)
    }

    #[test]
    fn size_counts_distinct_partitions() {
        let mut batch = CommittableBatch::default();
        assert_eq!(batch.update_offset(&partition(0), 1), 1);
        assert_eq!(batch.update_offset(&partition(0), 2), 1);
        assert_eq!(batch.update_offset(&partition(1), 7), 2);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn offsets_never_move_backwards() {
        let mut batch = CommittableBatch::default();
        batch.update_offset(&partition(0), 10);
        batch.update_offset(&partition(0), 4);
        let args = batch.snapshot_and_clear();
        assert_eq!(args.offsets[&partition(0)], 10);
    }

    #[test]
    fn snapshot_clears_and_encodes_next_offset() {
        let mut batch = CommittableBatch::default();
        batch.update_offset(&partition(0), 41);
        let args = batch.snapshot_and_clear();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);

        let tpl = args.to_tpl().expect("valid commit list");
        let elem = tpl.find_partition("events", 0).expect("partition present");
        assert_eq!(elem.offset(), Offset::Offset(42));
    }

    #[test]
    fn restore_keeps_newer_acks() {
        let mut batch = CommittableBatch::default();
        batch.update_offset(&partition(0), 5);
        batch.update_offset(&partition(1), 9);
        let args = batch.snapshot_and_clear();

        // Partition 0 was re-acked while the commit was in flight.
        batch.update_offset(&partition(0), 6);
        let leftover = batch.restore(args, true);
        assert!(leftover.is_empty());

        let restored = batch.snapshot_and_clear();
        assert_eq!(restored.offsets[&partition(0)], 6);
        assert_eq!(restored.offsets[&partition(1)], 9);
    }

    #[test]
    fn restore_hands_back_notifiers_when_not_re_registering() {
        let mut batch = CommittableBatch::default();
        batch.update_offset(&partition(0), 1);
        let (tx, mut rx) = oneshot::channel();
        batch.add_notifier(tx);
        let args = batch.snapshot_and_clear();

        let leftover = batch.restore(args, false);
        assert_eq!(leftover.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_snapshot_still_carries_notifiers() {
        let mut batch = CommittableBatch::default();
        let (tx, _rx) = oneshot::channel();
        batch.add_notifier(tx);
        let args = batch.snapshot_and_clear();
        assert!(args.is_empty());
        assert_eq!(args.notifiers.len(), 1);
    }

    mod handles {
        use std::sync::Arc;
        use std::time::Duration;

        use tokio::sync::mpsc;

        use super::partition;
        use crate::config::AckMode;
        use crate::offsets::CommittableOffset;
        use crate::shared::ReceiverShared;

        fn shared(ack_mode: AckMode) -> (Arc<ReceiverShared>, mpsc::Receiver<crate::shared::Event>) {
            let (event_tx, event_rx) = mpsc::channel(8);
            (
                Arc::new(ReceiverShared::new(
                    ack_mode,
                    0,
                    Duration::from_secs(5),
                    event_tx,
                )),
                event_rx,
            )
        }

        fn offset_handle(
            shared: &Arc<ReceiverShared>,
            ack_mode: AckMode,
            offset: i64,
        ) -> CommittableOffset {
            CommittableOffset::new(
                partition(0),
                offset,
                ack_mode,
                false,
                Arc::downgrade(shared),
            )
        }

        #[test]
        fn double_acknowledge_updates_batch_once() {
            let (shared, _event_rx) = shared(AckMode::ManualAck);
            let handle = offset_handle(&shared, AckMode::ManualAck, 3);
            handle.acknowledge();
            handle.acknowledge();
            assert!(handle.is_acknowledged());
            assert_eq!(shared.lock_batch().len(), 1);
        }

        #[tokio::test]
        async fn commit_after_acknowledge_on_empty_batch_is_resolved() {
            let (shared, _event_rx) = shared(AckMode::ManualCommit);
            let handle = offset_handle(&shared, AckMode::ManualCommit, 3);
            handle.acknowledge();
            // Simulate the loop flushing the batch.
            let _args = shared.lock_batch().snapshot_and_clear();
            handle.commit().await.expect("nothing left to flush");
        }

        #[tokio::test]
        async fn commit_schedules_flush_and_registers_notifier() {
            let (shared, mut event_rx) = shared(AckMode::ManualCommit);
            let handle = offset_handle(&shared, AckMode::ManualCommit, 3);
            let pending = handle.commit();

            assert!(matches!(
                event_rx.try_recv(),
                Ok(crate::shared::Event::Commit)
            ));
            let args = shared.lock_batch().snapshot_and_clear();
            assert_eq!(args.len(), 1);
            assert_eq!(args.notifiers.len(), 1);
            args.resolve(|| Ok(()));
            pending.await.expect("commit resolved");
        }

        #[tokio::test]
        async fn handles_outlive_the_receiver_as_no_ops() {
            let (shared, _event_rx) = shared(AckMode::ManualAck);
            let handle = offset_handle(&shared, AckMode::ManualAck, 7);
            drop(shared);

            handle.acknowledge();
            let err = handle.commit().await.expect_err("receiver is gone");
            assert!(matches!(err, crate::error::ReceiverError::Closed));
        }

        #[tokio::test]
        async fn at_most_once_handles_are_inert() {
            let (shared, mut event_rx) = shared(AckMode::AtMostOnce);
            let handle = offset_handle(&shared, AckMode::AtMostOnce, 1);
            handle.acknowledge();
            handle.commit().await.expect("already committed");
            assert_eq!(shared.lock_batch().len(), 0);
            assert!(event_rx.try_recv().is_err());
        }
    }
}
