// ==== Dispatch metrics ====
/// Counter for records received from the broker
pub const RECORDS_RECEIVED: &str = "event_consumer_records_received_total";

/// Counter for handler outcomes, labelled by `outcome`
pub const RECORDS_HANDLED: &str = "event_consumer_records_handled_total";

/// Counter for payloads that could not be deserialized
pub const RECORDS_MALFORMED: &str = "event_consumer_records_malformed_total";

/// Histogram of handler execution time
pub const HANDLER_DURATION: &str = "event_consumer_handler_duration_seconds";

/// Counter for partitions paused because their queue was full
pub const PARTITION_PAUSES: &str = "event_consumer_partition_pauses_total";

// ==== Commit metrics ====
/// Counter for commit attempts, labelled by `outcome`
pub const COMMITS: &str = "event_consumer_commits_total";

/// Counter for successes whose commit was withheld by the commit policy
pub const COMMITS_WITHHELD: &str = "event_consumer_commits_withheld_total";

// ==== Rebalance metrics ====
/// Counter for rebalance signals, labelled by `event_type`
pub const REBALANCES: &str = "event_consumer_rebalances_total";

/// Counter for rebalance signals that could not be applied
pub const REBALANCE_ERRORS: &str = "event_consumer_rebalance_errors_total";

/// Gauge for the number of partitions currently owned
pub const ASSIGNED_PARTITIONS: &str = "event_consumer_assigned_partitions";
