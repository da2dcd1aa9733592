use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{AckMode, ReceiverOptions, Subscription};
use crate::context::ReceiverContext;
use crate::error::{commit_error_code, commit_error_is_retriable, ReceiverError};
use crate::metrics_const::{
    BATCHES_EMITTED_COUNTER, COMMITS_ISSUED_COUNTER, COMMIT_FAILURES_COUNTER,
    COMMIT_RETRIES_COUNTER, HEARTBEATS_COUNTER, IN_FLIGHT_COMMITS_GAUGE,
    RECORDS_RECEIVED_COUNTER,
};
use crate::offsets::{CommitArgs, CommittableOffset};
use crate::receiver::ReceiverRecord;
use crate::shared::{Event, Feedback, ReceiverShared, ReceiverState};
use crate::types::TopicPartition;

/// Commit-drain polls during close are kept short so the deadline is
/// honored with little overshoot.
const CLOSE_DRAIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) type BatchItem = Result<Vec<ReceiverRecord>, ReceiverError>;

/// Single-threaded dispatcher owning the consumer. Every consumer call in
/// the crate happens on the thread running [`EventLoop::run`]; rebalance and
/// commit callbacks re-enter on the same thread from inside `poll`.
pub(crate) struct EventLoop {
    shared: Arc<ReceiverShared>,
    options: Arc<ReceiverOptions>,
    records_tx: tokio::sync::mpsc::UnboundedSender<BatchItem>,
    event_rx: tokio::sync::mpsc::Receiver<Event>,
    consumer: Option<BaseConsumer<ReceiverContext>>,
    in_flight: VecDeque<CommitArgs>,
    in_progress: usize,
    consecutive_commit_failures: u32,
}

impl EventLoop {
    pub fn new(
        shared: Arc<ReceiverShared>,
        options: Arc<ReceiverOptions>,
        records_tx: tokio::sync::mpsc::UnboundedSender<BatchItem>,
        event_rx: tokio::sync::mpsc::Receiver<Event>,
    ) -> Self {
        Self {
            shared,
            options,
            records_tx,
            event_rx,
            consumer: None,
            in_flight: VecDeque::new(),
            in_progress: 0,
            consecutive_commit_failures: 0,
        }
    }

    pub fn run(mut self) {
        while let Some(event) = self.event_rx.blocking_recv() {
            let outcome = match event {
                Event::Init => self.on_init(),
                Event::Poll => self.on_poll(),
                Event::Heartbeat => self.on_heartbeat(),
                Event::Commit => self.on_commit(false),
                Event::Close(deadline) => {
                    self.on_close(deadline);
                    return;
                }
            };
            if let Err(err) = outcome {
                self.emit_fatal(err);
                self.on_close(self.close_deadline());
                return;
            }
            // A poll event dropped on queue overflow must not strand
            // demand; the pending flag makes this re-issue a no-op in the
            // common case.
            if self.shared.is_active()
                && self.shared.requests_pending.load(Ordering::SeqCst) > 0
            {
                self.shared.schedule_poll();
            }
        }
    }

    fn close_deadline(&self) -> Instant {
        Instant::now()
            .checked_add(self.options.close_timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 60 * 60))
    }

    fn emit_fatal(&mut self, err: ReceiverError) {
        error!(error = %err, "receiver event loop failed");
        drop(self.records_tx.send(Err(err)));
        self.shared.begin_closing();
    }

    fn on_init(&mut self) -> Result<(), ReceiverError> {
        if self.shared.state() != ReceiverState::Created {
            return Ok(());
        }
        let context = ReceiverContext::new(self.shared.clone(), self.options.listeners.clone());
        let mut client_config = self.options.client_config.clone();
        // Offsets are committed explicitly by the receiver.
        client_config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: BaseConsumer<ReceiverContext> =
            client_config.create_with_context(context)?;

        match &self.options.subscription {
            Subscription::Topics(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&topics)?;
            }
            Subscription::Pattern(pattern) => {
                let pattern = if pattern.starts_with('^') {
                    pattern.clone()
                } else {
                    format!("^{pattern}")
                };
                consumer.subscribe(&[pattern.as_str()])?;
            }
            Subscription::Partitions(partitions) => {
                let mut tpl = TopicPartitionList::with_capacity(partitions.len());
                for partition in partitions {
                    tpl.add_partition_offset(
                        partition.topic(),
                        partition.partition(),
                        Offset::Stored,
                    )?;
                }
                consumer.assign(&tpl)?;
                // Manual assignment fires no rebalance callback, so the
                // assign listeners run here instead.
                let wrapped = ReceiverContext::wrap_partitions(&consumer, &tpl);
                for listener in &self.options.listeners {
                    listener
                        .on_partitions_assigned(&wrapped)
                        .map_err(|err| ReceiverError::Listener(format!("{err:#}")))?;
                }
            }
        }

        // Zero-timeout poll to kick off the group join without fetching.
        drop(consumer.poll(Duration::ZERO));
        self.consumer = Some(consumer);
        self.drain_feedback()?;
        self.shared.mark_active();
        info!(subscription = ?self.options.subscription, "kafka receiver started");
        Ok(())
    }

    fn on_poll(&mut self) -> Result<(), ReceiverError> {
        self.shared.clear_poll_pending();
        if !self.shared.is_active() {
            return Ok(());
        }
        self.on_commit(false)?;

        let demand = self.shared.requests_pending.load(Ordering::SeqCst);
        if demand <= 0 {
            return Ok(());
        }
        let Some(consumer) = self.consumer.as_ref() else {
            return Ok(());
        };
        self.shared.needs_heartbeat.store(false, Ordering::SeqCst);

        let mut messages = Vec::new();
        let mut timeout = self.options.poll_timeout;
        while (messages.len() as i64) < demand {
            match consumer.poll(timeout) {
                None => break,
                Some(Ok(message)) => messages.push(message.detach()),
                Some(Err(err)) => {
                    // Transient client errors (transport blips, partition
                    // EOF when enabled) surface here; the next poll retries.
                    warn!(error = %err, "kafka poll returned an error");
                    break;
                }
            }
            // Only the first poll of a batch blocks.
            timeout = Duration::ZERO;
        }
        self.drain_feedback()?;

        let emitted = if messages.is_empty() {
            0
        } else {
            self.emit_records(messages)?
        };
        if emitted > 0 {
            metrics::counter!(RECORDS_RECEIVED_COUNTER).increment(emitted as u64);
            metrics::counter!(BATCHES_EMITTED_COUNTER).increment(1);
        }
        let residual =
            self.shared.requests_pending.fetch_sub(emitted as i64, Ordering::SeqCst)
                - emitted as i64;
        if residual > 0 && self.shared.is_active() {
            self.shared.schedule_poll();
        }
        Ok(())
    }

    /// Wraps polled messages into records carrying committable offsets and
    /// hands them to the stream as one batch, applying the ack mode's
    /// emission side effects first.
    fn emit_records(&mut self, messages: Vec<rdkafka::message::OwnedMessage>) -> Result<usize, ReceiverError> {
        let ack_mode = self.options.ack_mode;
        let mut batch = Vec::with_capacity(messages.len());
        for message in messages {
            let partition = TopicPartition::new(message.topic(), message.partition());
            let offset = message.offset();
            match ack_mode {
                AckMode::AtMostOnce => {
                    // The commit must complete before the record becomes
                    // visible downstream; a failure fails the stream and the
                    // record is never observed.
                    if let Err(err) = self.commit_sync_single(&partition, offset) {
                        let emitted = batch.len();
                        if emitted > 0 {
                            drop(self.records_tx.send(Ok(batch)));
                            let _ = self
                                .shared
                                .requests_pending
                                .fetch_sub(emitted as i64, Ordering::SeqCst);
                        }
                        return Err(err);
                    }
                }
                AckMode::AutoAck => self.shared.acknowledge(&partition, offset),
                AckMode::ManualAck | AckMode::ManualCommit => {}
            }
            let pre_acknowledged =
                matches!(ack_mode, AckMode::AutoAck | AckMode::AtMostOnce);
            let committable = CommittableOffset::new(
                partition,
                offset,
                ack_mode,
                pre_acknowledged,
                Arc::downgrade(&self.shared),
            );
            batch.push(ReceiverRecord::new(message, committable));
        }
        let emitted = batch.len();
        if self.records_tx.send(Ok(batch)).is_err() {
            // The stream was dropped; a close event is on its way.
            debug!("record stream dropped, discarding polled batch");
        }
        Ok(emitted)
    }

    fn commit_sync_single(
        &self,
        partition: &TopicPartition,
        offset: i64,
    ) -> Result<(), ReceiverError> {
        let Some(consumer) = self.consumer.as_ref() else {
            return Err(ReceiverError::Closed);
        };
        let mut tpl = TopicPartitionList::with_capacity(1);
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition(),
            Offset::Offset(offset + 1),
        )?;
        consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn on_heartbeat(&mut self) -> Result<(), ReceiverError> {
        if !self.shared.is_active() {
            return Ok(());
        }
        if !self.shared.needs_heartbeat.swap(true, Ordering::SeqCst) {
            // A poll ran since the last tick; the group session is alive.
            return Ok(());
        }
        let Some(consumer) = self.consumer.as_ref() else {
            return Ok(());
        };
        let assignment = consumer.assignment()?;
        if let Err(err) = consumer.pause(&assignment) {
            warn!(error = %err, "failed to pause partitions for heartbeat");
            return Ok(());
        }
        drop(consumer.poll(Duration::ZERO));
        if let Err(err) = consumer.resume(&assignment) {
            warn!(error = %err, "failed to resume partitions after heartbeat");
        }
        metrics::counter!(HEARTBEATS_COUNTER).increment(1);
        self.drain_feedback()
    }

    /// Flushes the batch if a commit is pending, or unconditionally when
    /// `force` is set (close and revoke paths). Commit results come back
    /// asynchronously through the context.
    fn on_commit(&mut self, force: bool) -> Result<(), ReceiverError> {
        if !self.shared.take_commit_pending(force) {
            return Ok(());
        }
        let args = self.shared.lock_batch().snapshot_and_clear();
        if args.is_empty() {
            // An empty snapshot is a successful commit of nothing.
            args.resolve(|| Ok(()));
            return Ok(());
        }
        let Some(consumer) = self.consumer.as_ref() else {
            self.shared.lock_batch().restore(args, true);
            return Ok(());
        };
        let tpl = args.to_tpl()?;
        debug!(partitions = args.len(), "committing offsets");
        match consumer.commit(&tpl, CommitMode::Async) {
            Ok(()) => {
                self.in_progress += 1;
                metrics::gauge!(IN_FLIGHT_COMMITS_GAUGE).set(self.in_progress as f64);
                metrics::counter!(COMMITS_ISSUED_COUNTER).increment(1);
                self.in_flight.push_back(args);
                Ok(())
            }
            Err(err) => self.handle_commit_failure(args, err),
        }
    }

    fn handle_commit_failure(
        &mut self,
        args: CommitArgs,
        err: KafkaError,
    ) -> Result<(), ReceiverError> {
        metrics::counter!(COMMIT_FAILURES_COUNTER).increment(1);
        let code = commit_error_code(&err);
        match self.options.ack_mode {
            AckMode::AtMostOnce => Err(ReceiverError::Kafka(err)),
            AckMode::ManualCommit => {
                // The application owns the retry policy.
                let notifiers = self.shared.lock_batch().restore(args, false);
                for notifier in notifiers {
                    drop(notifier.send(Err(ReceiverError::Commit(code))));
                }
                Ok(())
            }
            AckMode::AutoAck | AckMode::ManualAck => {
                if !commit_error_is_retriable(&err) {
                    return Err(ReceiverError::Kafka(err));
                }
                self.consecutive_commit_failures += 1;
                if self.consecutive_commit_failures >= self.options.max_auto_commit_attempts {
                    return Err(ReceiverError::CommitRetriesExhausted {
                        attempts: self.consecutive_commit_failures,
                        code,
                    });
                }
                warn!(
                    attempt = self.consecutive_commit_failures,
                    error = %err,
                    "retriable commit failure, offsets restored for retry"
                );
                metrics::counter!(COMMIT_RETRIES_COUNTER).increment(1);
                self.shared.lock_batch().restore(args, true);
                self.shared.schedule_commit();
                Ok(())
            }
        }
    }

    /// Applies callback results queued while the consumer was inside a
    /// poll: async commit completions and listener failures.
    fn drain_feedback(&mut self) -> Result<(), ReceiverError> {
        while let Some(feedback) = self.shared.pop_feedback() {
            match feedback {
                Feedback::CommitResult(result) => {
                    self.in_progress = self.in_progress.saturating_sub(1);
                    metrics::gauge!(IN_FLIGHT_COMMITS_GAUGE).set(self.in_progress as f64);
                    let args = self.in_flight.pop_front().unwrap_or_default();
                    match result {
                        Ok(()) => {
                            self.consecutive_commit_failures = 0;
                            args.resolve(|| Ok(()));
                        }
                        Err(err) => self.handle_commit_failure(args, err)?,
                    }
                }
                Feedback::ListenerError(message) => {
                    return Err(ReceiverError::Listener(message));
                }
            }
        }
        Ok(())
    }

    fn drain_feedback_logged(&mut self) {
        if let Err(err) = self.drain_feedback() {
            warn!(error = %err, "error while draining callbacks during close");
        }
    }

    /// Final commit, bounded drain of in-flight commits, consumer release.
    /// The state always ends up `Closed`.
    fn on_close(&mut self, deadline: Instant) {
        self.shared.begin_closing();
        info!("closing kafka receiver");
        if self.consumer.is_some() {
            if let Some(consumer) = self.consumer.as_ref() {
                drop(consumer.poll(Duration::ZERO));
            }
            self.drain_feedback_logged();
            if let Err(err) = self.on_commit(true) {
                warn!(error = %err, "final commit failed during close");
            }
            while self.in_progress > 0 && Instant::now() < deadline {
                if let Some(consumer) = self.consumer.as_ref() {
                    drop(consumer.poll(CLOSE_DRAIN_POLL_TIMEOUT));
                }
                self.drain_feedback_logged();
            }
            if self.in_progress > 0 {
                warn!(
                    in_progress = self.in_progress,
                    "close timeout reached with commits still in flight"
                );
            }
        }
        for args in self.in_flight.drain(..) {
            args.resolve(|| Err(ReceiverError::Closed));
        }
        let leftovers = self.shared.lock_batch().snapshot_and_clear();
        leftovers.resolve(|| Err(ReceiverError::Closed));
        // Dropping the consumer closes the client and leaves the group.
        self.consumer = None;
        metrics::gauge!(IN_FLIGHT_COMMITS_GAUGE).set(0.0);
        self.shared.set_closed();
        info!("kafka receiver closed");
    }
}

/// Spawns the heartbeat and periodic-commit tickers. Both feed plain events
/// into the loop's queue and exit as soon as the receiver leaves `Active`.
pub(crate) fn spawn_tickers(shared: &Arc<ReceiverShared>, options: &ReceiverOptions) {
    if !options.heartbeat_interval.is_zero() {
        let shared = Arc::clone(shared);
        let period = options.heartbeat_interval;
        tokio::spawn(async move {
            let mut state_rx = shared.subscribe_state();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.enqueue_heartbeat(),
                    changed = state_rx.changed() => {
                        if changed.is_err() || ticker_should_stop(*state_rx.borrow()) {
                            break;
                        }
                    }
                }
            }
        });
    }

    let commit_interval = match options.commit_interval {
        Some(interval)
            if !interval.is_zero()
                && matches!(options.ack_mode, AckMode::AutoAck | AckMode::ManualAck) =>
        {
            interval
        }
        _ => return,
    };
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut state_rx = shared.subscribe_state();
        let mut ticker = tokio::time::interval(commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => shared.schedule_commit(),
                changed = state_rx.changed() => {
                    if changed.is_err() || ticker_should_stop(*state_rx.borrow()) {
                        break;
                    }
                }
            }
        }
    });
}

fn ticker_should_stop(state: ReceiverState) -> bool {
    matches!(state, ReceiverState::Closing | ReceiverState::Closed)
}
