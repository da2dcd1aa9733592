use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use rdkafka::message::{Message, OwnedMessage, Timestamp};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::config::ReceiverOptions;
use crate::error::{PayloadError, ReceiverError};
use crate::event_loop::{spawn_tickers, BatchItem, EventLoop};
use crate::offsets::{CommitFuture, CommittableOffset};
use crate::shared::{ReceiverShared, ReceiverState, EVENT_QUEUE_CAPACITY};

/// Entry point of the crate: holds the captured options until the
/// application subscribes. Consuming `self` in [`receive`](Self::receive)
/// makes a second subscription unrepresentable.
pub struct KafkaReceiver {
    options: ReceiverOptions,
}

impl KafkaReceiver {
    pub fn new(options: ReceiverOptions) -> Self {
        Self { options }
    }

    /// Returns the record stream. The stream is cold: the consumer, the
    /// event-loop thread and the tickers are only created when it is first
    /// polled.
    pub fn receive(self) -> RecordStream {
        RecordStream {
            inner: Inner::Idle(Some(self.options)),
        }
    }
}

/// A record paired with its committable offset.
#[derive(Debug)]
pub struct ReceiverRecord {
    message: OwnedMessage,
    offset: CommittableOffset,
}

impl ReceiverRecord {
    pub(crate) fn new(message: OwnedMessage, offset: CommittableOffset) -> Self {
        Self { message, offset }
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    pub fn partition(&self) -> i32 {
        self.message.partition()
    }

    pub fn offset(&self) -> i64 {
        self.message.offset()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.message.key()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.message.timestamp()
    }

    pub fn message(&self) -> &OwnedMessage {
        &self.message
    }

    pub fn committable_offset(&self) -> &CommittableOffset {
        &self.offset
    }

    /// Shorthand for acknowledging through the committable offset.
    pub fn acknowledge(&self) {
        self.offset.acknowledge();
    }

    /// Shorthand for committing through the committable offset.
    pub fn commit(&self) -> CommitFuture {
        self.offset.commit()
    }

    pub fn payload_json<T>(&self) -> Result<T, PayloadError>
    where
        T: DeserializeOwned,
    {
        let Some(payload) = self.message.payload() else {
            return Err(PayloadError::Empty);
        };
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn into_parts(self) -> (OwnedMessage, CommittableOffset) {
        (self.message, self.offset)
    }
}

/// Back-pressured asynchronous sequence of records. Ends with a terminal
/// `Err` item on fatal receiver failure, or cleanly after close. Dropping
/// the stream triggers a graceful close.
pub struct RecordStream {
    inner: Inner,
}

enum Inner {
    Idle(Option<ReceiverOptions>),
    Running(Running),
    Terminated,
}

struct Running {
    shared: Arc<ReceiverShared>,
    records_rx: mpsc::UnboundedReceiver<BatchItem>,
    buffer: VecDeque<ReceiverRecord>,
    outstanding: i64,
    prefetch: usize,
    _loop_thread: std::thread::JoinHandle<()>,
}

impl Running {
    fn start(options: ReceiverOptions) -> Result<Self, ReceiverError> {
        let prefetch = options.prefetch;
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ReceiverShared::new(
            options.ack_mode,
            options.commit_batch_size,
            options.close_timeout,
            event_tx,
        ));
        shared.enqueue_init();

        let options = Arc::new(options);
        let event_loop = EventLoop::new(
            Arc::clone(&shared),
            Arc::clone(&options),
            records_tx,
            event_rx,
        );
        let loop_thread = std::thread::Builder::new()
            .name("kafka-receiver-loop".to_string())
            .spawn(move || event_loop.run())?;
        spawn_tickers(&shared, &options);

        Ok(Self {
            shared,
            records_rx,
            buffer: VecDeque::new(),
            outstanding: 0,
            prefetch,
            _loop_thread: loop_thread,
        })
    }

    /// Grants the event loop another round of demand once all previous
    /// credits have been consumed.
    fn maybe_request(&mut self) {
        if self.outstanding > 0 {
            return;
        }
        if matches!(
            self.shared.state(),
            ReceiverState::Created | ReceiverState::Active
        ) {
            let n = self.prefetch as i64;
            self.outstanding += n;
            self.shared.request(n);
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        // Stream cancellation: commit what has been acknowledged and
        // release the consumer within the close timeout.
        self.shared.initiate_close();
    }
}

impl RecordStream {
    /// Handle for closing the receiver from another task and awaiting the
    /// terminal state. `None` until the stream has been polled once.
    pub fn close_handle(&self) -> Option<CloseHandle> {
        match &self.inner {
            Inner::Running(running) => Some(CloseHandle {
                shared: Arc::clone(&running.shared),
            }),
            _ => None,
        }
    }

    /// Gracefully closes the receiver and waits until the consumer has been
    /// released (bounded by the configured close timeout).
    pub async fn close(self) {
        let handle = self.close_handle();
        drop(self);
        if let Some(handle) = handle {
            handle.closed().await;
        }
    }
}

impl Stream for RecordStream {
    type Item = Result<ReceiverRecord, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.inner {
                Inner::Idle(options) => match options.take() {
                    Some(options) => match Running::start(options) {
                        Ok(running) => this.inner = Inner::Running(running),
                        Err(err) => {
                            this.inner = Inner::Terminated;
                            return Poll::Ready(Some(Err(err)));
                        }
                    },
                    None => this.inner = Inner::Terminated,
                },
                Inner::Running(running) => {
                    if let Some(record) = running.buffer.pop_front() {
                        return Poll::Ready(Some(Ok(record)));
                    }
                    match running.records_rx.poll_recv(cx) {
                        Poll::Ready(Some(Ok(batch))) => {
                            running.outstanding -= batch.len() as i64;
                            running.buffer.extend(batch);
                        }
                        Poll::Ready(Some(Err(err))) => {
                            this.inner = Inner::Terminated;
                            return Poll::Ready(Some(Err(err)));
                        }
                        Poll::Ready(None) => {
                            this.inner = Inner::Terminated;
                            return Poll::Ready(None);
                        }
                        Poll::Pending => {
                            running.maybe_request();
                            return Poll::Pending;
                        }
                    }
                }
                Inner::Terminated => return Poll::Ready(None),
            }
        }
    }
}

/// Closes the receiver and observes its terminal state from outside the
/// stream-consuming task.
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<ReceiverShared>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.shared.initiate_close();
    }

    /// Resolves once the consumer has been released and the state machine
    /// reached `Closed`.
    pub async fn closed(&self) {
        let mut state_rx = self.shared.subscribe_state();
        loop {
            if *state_rx.borrow() == ReceiverState::Closed {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state()
    }
}
