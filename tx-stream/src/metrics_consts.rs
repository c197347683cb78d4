// Kafka client
pub const CONSUMER_LAG: &str = "tx_stream_consumer_lag";
pub const FETCH_ERRORS_COUNTER: &str = "tx_stream_fetch_errors_total";
pub const RECORDS_FETCHED_COUNTER: &str = "tx_stream_records_fetched_total";
pub const OFFSET_COMMITS_COUNTER: &str = "tx_stream_offset_commits_total";
pub const OFFSET_COMMIT_FAILURES_COUNTER: &str = "tx_stream_offset_commit_failures_total";
pub const REBALANCE_EVENTS_COUNTER: &str = "tx_stream_rebalance_events_total";
pub const PRODUCER_QUEUE_DEPTH: &str = "tx_stream_producer_queue_depth";

// Transaction processing
pub const TRANSACTIONS_PUBLISHED_COUNTER: &str = "tx_stream_transactions_published_total";
pub const MALFORMED_TRANSACTIONS_COUNTER: &str = "tx_stream_malformed_transactions_total";
pub const PUBLISH_DURATION_HISTOGRAM: &str = "tx_stream_publish_duration_seconds";

// Dead letters
pub const DEAD_LETTER_RECORDS_COUNTER: &str = "tx_stream_dead_letter_records_total";
pub const DEAD_LETTER_FAILURES_COUNTER: &str = "tx_stream_dead_letter_failures_total";
