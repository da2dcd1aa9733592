//! Metric names reported by the receiver.

pub const RECORDS_RECEIVED_COUNTER: &str = "kafka_receiver_records_received_total";
pub const BATCHES_EMITTED_COUNTER: &str = "kafka_receiver_batches_emitted_total";
pub const COMMITS_ISSUED_COUNTER: &str = "kafka_receiver_offset_commits_total";
pub const COMMIT_FAILURES_COUNTER: &str = "kafka_receiver_offset_commit_failures_total";
pub const COMMIT_RETRIES_COUNTER: &str = "kafka_receiver_offset_commit_retries_total";
pub const HEARTBEATS_COUNTER: &str = "kafka_receiver_heartbeats_total";
pub const PARTITIONS_ASSIGNED_COUNTER: &str = "kafka_receiver_partitions_assigned_total";
pub const PARTITIONS_REVOKED_COUNTER: &str = "kafka_receiver_partitions_revoked_total";
pub const IN_FLIGHT_COMMITS_GAUGE: &str = "kafka_receiver_in_flight_commits";
