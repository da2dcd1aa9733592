use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rdkafka::error::KafkaResult;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::AckMode;
use crate::offsets::CommittableBatch;
use crate::types::TopicPartition;

/// Capacity of the bounded event queue feeding the loop thread. Poll and
/// Commit carry pending flags, so a dropped duplicate is harmless; Close has
/// a blocking fallback.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 16;

/// Deadline fallback when `close_timeout` overflows `Instant` arithmetic.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Lifecycle of a receiver. `Active` is entered exactly once; any event
/// observed after `Closing` is a no-op except Close itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Active,
    Closing,
    Closed,
}

/// Discrete tasks executed by the event-loop thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Event {
    Init,
    Poll,
    Heartbeat,
    Commit,
    Close(Instant),
}

/// Results produced by consumer callbacks while the loop is inside a poll,
/// drained by the loop right after the call returns.
pub(crate) enum Feedback {
    CommitResult(KafkaResult<()>),
    ListenerError(String),
}

/// State shared between the event loop, the record stream, the tickers and
/// every emitted [`crate::CommittableOffset`]. The consumer itself is *not*
/// here: it is owned exclusively by the loop thread.
pub(crate) struct ReceiverShared {
    ack_mode: AckMode,
    commit_batch_size: usize,
    close_timeout: Duration,
    batch: Mutex<CommittableBatch>,
    event_tx: mpsc::Sender<Event>,
    state: watch::Sender<ReceiverState>,
    feedback: Mutex<VecDeque<Feedback>>,
    pub(crate) requests_pending: AtomicI64,
    poll_pending: AtomicBool,
    commit_pending: AtomicBool,
    pub(crate) needs_heartbeat: AtomicBool,
}

impl ReceiverShared {
    pub fn new(
        ack_mode: AckMode,
        commit_batch_size: usize,
        close_timeout: Duration,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        let (state, _) = watch::channel(ReceiverState::Created);
        Self {
            ack_mode,
            commit_batch_size,
            close_timeout,
            batch: Mutex::new(CommittableBatch::default()),
            event_tx,
            state,
            feedback: Mutex::new(VecDeque::new()),
            requests_pending: AtomicI64::new(0),
            poll_pending: AtomicBool::new(false),
            commit_pending: AtomicBool::new(false),
            needs_heartbeat: AtomicBool::new(true),
        }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ReceiverState::Active
    }

    pub fn mark_active(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ReceiverState::Created {
                *state = ReceiverState::Active;
                true
            } else {
                false
            }
        })
    }

    pub fn begin_closing(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, ReceiverState::Created | ReceiverState::Active) {
                *state = ReceiverState::Closing;
                true
            } else {
                false
            }
        })
    }

    pub fn set_closed(&self) {
        self.state.send_if_modified(|state| {
            if *state == ReceiverState::Closed {
                false
            } else {
                *state = ReceiverState::Closed;
                true
            }
        });
    }

    pub fn lock_batch(&self) -> MutexGuard<'_, CommittableBatch> {
        self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers downstream demand for `n` more records. Schedules a Poll
    /// only on the transition from no demand to positive demand; the loop
    /// keeps rescheduling itself while residual demand remains.
    pub fn request(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let previous = self.requests_pending.fetch_add(n, Ordering::SeqCst);
        if previous <= 0 {
            self.schedule_poll();
        }
    }

    /// Enqueues a Poll event unless one is already pending.
    pub fn schedule_poll(&self) {
        if self.poll_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.event_tx.try_send(Event::Poll) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // The loop is saturated; it will re-derive demand from
                // `requests_pending` once it drains the queue.
                self.poll_pending.store(false, Ordering::SeqCst);
                warn!("receiver event queue full, dropping poll event");
            }
            Err(TrySendError::Closed(_)) => {
                self.poll_pending.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn clear_poll_pending(&self) {
        self.poll_pending.store(false, Ordering::SeqCst);
    }

    /// Marks a commit as pending and enqueues a Commit event. If the queue
    /// is full the flag stays set and the next Poll runs the commit
    /// opportunistically.
    pub fn schedule_commit(&self) {
        if self.commit_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.event_tx.try_send(Event::Commit) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("receiver event queue full, commit deferred to next poll");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Consumes the commit-pending flag. With `force` the commit runs even
    /// without a pending request, except in manual-commit mode where flushes
    /// only ever happen on explicit request.
    pub fn take_commit_pending(&self, force: bool) -> bool {
        if force && self.ack_mode != AckMode::ManualCommit {
            self.commit_pending.store(false, Ordering::SeqCst);
            true
        } else {
            self.commit_pending.swap(false, Ordering::SeqCst)
        }
    }

    pub fn enqueue_init(&self) {
        if self.event_tx.try_send(Event::Init).is_err() {
            warn!("receiver event queue rejected init event");
        }
    }

    pub fn enqueue_heartbeat(&self) {
        if let Err(TrySendError::Full(_)) = self.event_tx.try_send(Event::Heartbeat) {
            // A saturated queue means the loop is busy polling, which keeps
            // the session alive anyway.
            debug!("receiver event queue full, skipping heartbeat event");
        }
    }

    /// Records an acknowledgement and flushes the batch once it reaches the
    /// configured size (auto-ack modes only).
    pub fn acknowledge(&self, partition: &TopicPartition, offset: i64) {
        let size = self.lock_batch().update_offset(partition, offset);
        if self.commit_batch_size > 0
            && size >= self.commit_batch_size
            && matches!(self.ack_mode, AckMode::AutoAck | AckMode::ManualAck)
        {
            self.schedule_commit();
        }
    }

    pub fn push_feedback(&self, feedback: Feedback) {
        self.feedback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(feedback);
    }

    pub fn pop_feedback(&self) -> Option<Feedback> {
        self.feedback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    /// Transitions to `Closing` and hands the loop a Close event carrying
    /// the commit-drain deadline. The event must reach the loop so the
    /// client is always released; a full queue falls back to a blocking send
    /// from a helper thread.
    pub fn initiate_close(self: &Arc<Self>) {
        if !self.begin_closing() {
            return;
        }
        let deadline = Instant::now()
            .checked_add(self.close_timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        match self.event_tx.try_send(Event::Close(deadline)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let event_tx = self.event_tx.clone();
                std::thread::spawn(move || {
                    let _ = event_tx.blocking_send(event);
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(capacity: usize) -> (Arc<ReceiverShared>, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let shared = Arc::new(ReceiverShared::new(
            AckMode::ManualAck,
            0,
            Duration::from_secs(5),
            event_tx,
        ));
        (shared, event_rx)
    }

    #[test]
    fn request_schedules_a_single_poll() {
        let (shared, mut event_rx) = shared(4);
        shared.request(3);
        shared.request(2);

        assert!(matches!(event_rx.try_recv(), Ok(Event::Poll)));
        assert!(event_rx.try_recv().is_err());
        assert_eq!(shared.requests_pending.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn demand_transition_reschedules_after_drain() {
        let (shared, mut event_rx) = shared(4);
        shared.request(1);
        let _ = event_rx.try_recv();

        // Loop finished the poll and consumed all demand.
        shared.clear_poll_pending();
        shared.requests_pending.fetch_sub(1, Ordering::SeqCst);

        shared.request(1);
        assert!(matches!(event_rx.try_recv(), Ok(Event::Poll)));
    }

    #[test]
    fn commit_pending_is_consumed_once() {
        let (shared, mut event_rx) = shared(4);
        shared.schedule_commit();
        shared.schedule_commit();

        assert!(matches!(event_rx.try_recv(), Ok(Event::Commit)));
        assert!(event_rx.try_recv().is_err());
        assert!(shared.take_commit_pending(false));
        assert!(!shared.take_commit_pending(false));
    }

    #[test]
    fn force_bypasses_pending_except_for_manual_commit() {
        let (shared, _event_rx) = shared(4);
        assert!(shared.take_commit_pending(true));

        let (event_tx, _keep) = mpsc::channel(4);
        let manual = ReceiverShared::new(
            AckMode::ManualCommit,
            0,
            Duration::from_secs(5),
            event_tx,
        );
        assert!(!manual.take_commit_pending(true));
        manual.schedule_commit();
        assert!(manual.take_commit_pending(true));
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let (shared, _event_rx) = shared(4);
        assert_eq!(shared.state(), ReceiverState::Created);
        assert!(shared.mark_active());
        assert!(!shared.mark_active());
        assert!(shared.begin_closing());
        assert!(!shared.begin_closing());
        shared.set_closed();
        assert_eq!(shared.state(), ReceiverState::Closed);
    }

    #[test]
    fn close_is_initiated_once() {
        let (shared, mut event_rx) = shared(4);
        shared.initiate_close();
        shared.initiate_close();
        assert!(matches!(event_rx.try_recv(), Ok(Event::Close(_))));
        assert!(event_rx.try_recv().is_err());
    }
}
