use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::context::RebalanceListener;
use crate::types::TopicPartition;

/// Policy controlling when consumed offsets are committed back to the
/// broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Records are acknowledged as they are emitted; commits happen on the
    /// commit interval or batch-size threshold.
    AutoAck,
    /// The application acknowledges records explicitly; commits happen on
    /// the commit interval or batch-size threshold.
    ManualAck,
    /// Acknowledgements are only recorded; nothing is flushed until the
    /// application calls `commit()` on an offset.
    ManualCommit,
    /// Every record's offset is committed synchronously before the record
    /// is delivered.
    AtMostOnce,
}

/// What the receiver subscribes to when it initializes.
#[derive(Debug, Clone)]
pub enum Subscription {
    /// Group subscription to a list of topics.
    Topics(Vec<String>),
    /// Group subscription to every topic matching a regex. The pattern is
    /// anchored with `^` if it is not already.
    Pattern(String),
    /// Explicit partition assignment, starting from the stored offsets. No
    /// group rebalancing takes place.
    Partitions(Vec<TopicPartition>),
}

impl Subscription {
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Topics(topics.into_iter().map(Into::into).collect())
    }
}

pub(crate) const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(5000);
pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_MAX_AUTO_COMMIT_ATTEMPTS: u32 = 100;
pub(crate) const DEFAULT_PREFETCH: usize = 64;

/// Immutable configuration captured when the receiver is created.
///
/// Arbitrary consumer properties pass through the wrapped
/// [`rdkafka::ClientConfig`]; the receiver only overrides the offset-commit
/// settings it owns (`enable.auto.commit` is always forced off).
pub struct ReceiverOptions {
    pub(crate) client_config: ClientConfig,
    pub(crate) subscription: Subscription,
    pub(crate) ack_mode: AckMode,
    pub(crate) poll_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) commit_interval: Option<Duration>,
    pub(crate) commit_batch_size: usize,
    pub(crate) close_timeout: Duration,
    pub(crate) max_auto_commit_attempts: u32,
    pub(crate) prefetch: usize,
    pub(crate) listeners: Vec<Arc<dyn RebalanceListener>>,
}

impl ReceiverOptions {
    pub fn new(client_config: ClientConfig, subscription: Subscription) -> Self {
        Self {
            client_config,
            subscription,
            ack_mode: AckMode::ManualAck,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            commit_interval: Some(DEFAULT_COMMIT_INTERVAL),
            commit_batch_size: 0,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_auto_commit_attempts: DEFAULT_MAX_AUTO_COMMIT_ATTEMPTS,
            prefetch: DEFAULT_PREFETCH,
            listeners: Vec::new(),
        }
    }

    /// Builds options from the environment-driven configuration structs,
    /// subscribing to the configured topic.
    pub fn from_config(common_config: &KafkaConfig, consumer_config: &ConsumerConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            );

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let commit_interval = match consumer_config.kafka_consumer_commit_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Self::new(
            client_config,
            Subscription::Topics(vec![consumer_config.kafka_consumer_topic.clone()]),
        )
        .with_poll_timeout(Duration::from_millis(
            consumer_config.kafka_consumer_poll_timeout_ms,
        ))
        .with_heartbeat_interval(Duration::from_millis(
            consumer_config.kafka_consumer_heartbeat_interval_ms,
        ))
        .with_commit_interval(commit_interval)
        .with_commit_batch_size(consumer_config.kafka_consumer_commit_batch_size)
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Upper bound on each consumer poll issued by the event loop.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Cadence of periodic auto-commits in `AutoAck`/`ManualAck` modes.
    /// `None` disables the ticker.
    pub fn with_commit_interval(mut self, commit_interval: Option<Duration>) -> Self {
        self.commit_interval = commit_interval;
        self
    }

    /// Number of distinct partitions with pending acknowledgements that
    /// triggers an immediate flush. Zero disables size-based flushing.
    pub fn with_commit_batch_size(mut self, commit_batch_size: usize) -> Self {
        self.commit_batch_size = commit_batch_size;
        self
    }

    /// Upper bound for graceful shutdown: the close path waits this long for
    /// in-flight commits before releasing the consumer.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Retry budget for consecutive auto-commit failures before the stream
    /// is failed.
    pub fn with_max_auto_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_auto_commit_attempts = attempts.max(1);
        self
    }

    /// Number of records the stream requests from the event loop per demand
    /// refill. Bounds how far the receiver reads ahead of the application.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Registers a listener invoked on partition assignment and revocation,
    /// in registration order.
    pub fn with_rebalance_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets an arbitrary property on the underlying consumer configuration.
    pub fn set_property(mut self, key: &str, value: &str) -> Self {
        self.client_config.set(key, value);
        self
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn commit_interval(&self) -> Option<Duration> {
        self.commit_interval
    }

    pub fn commit_batch_size(&self) -> usize {
        self.commit_batch_size
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }
}

impl fmt::Debug for ReceiverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverOptions")
            .field("subscription", &self.subscription)
            .field("ack_mode", &self.ack_mode)
            .field("poll_timeout", &self.poll_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("commit_interval", &self.commit_interval)
            .field("commit_batch_size", &self.commit_batch_size)
            .field("close_timeout", &self.close_timeout)
            .field("max_auto_commit_attempts", &self.max_auto_commit_attempts)
            .field("prefetch", &self.prefetch)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "100")]
    pub kafka_consumer_poll_timeout_ms: u64,

    #[envconfig(default = "3000")]
    pub kafka_consumer_heartbeat_interval_ms: u64,

    // 0 disables periodic commits entirely
    #[envconfig(default = "5000")]
    pub kafka_consumer_commit_interval_ms: u64,

    #[envconfig(default = "0")]
    pub kafka_consumer_commit_batch_size: usize,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn options_defaults() {
        let options = ReceiverOptions::new(
            ClientConfig::new(),
            Subscription::topics(["events"]),
        );
        assert_eq!(options.ack_mode(), AckMode::ManualAck);
        assert_eq!(options.poll_timeout(), Duration::from_millis(100));
        assert_eq!(options.commit_interval(), Some(Duration::from_millis(5000)));
        assert_eq!(options.commit_batch_size(), 0);
        assert_eq!(options.max_auto_commit_attempts, 100);
    }

    #[test]
    fn consumer_config_from_hashmap() {
        let mut env = HashMap::new();
        env.insert("KAFKA_CONSUMER_GROUP".to_string(), "group".to_string());
        env.insert("KAFKA_CONSUMER_TOPIC".to_string(), "topic".to_string());
        env.insert(
            "KAFKA_CONSUMER_COMMIT_INTERVAL_MS".to_string(),
            "0".to_string(),
        );

        let config = ConsumerConfig::init_from_hashmap(&env).expect("config should parse");
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert_eq!(config.kafka_consumer_poll_timeout_ms, 100);

        let kafka = KafkaConfig::init_from_hashmap(&HashMap::new()).expect("defaults");
        let options = ReceiverOptions::from_config(&kafka, &config);
        assert_eq!(options.commit_interval(), None);
    }
}
