// Consumer
pub const CONSUMER_KAFKA_ERROR: &str = "replay_consumer_kafka_error_total";
pub const MESSAGES_RECEIVED: &str = "replay_consumer_messages_received_total";
pub const MESSAGES_DROPPED: &str = "replay_consumer_messages_dropped_total";
pub const OFFSETS_COMMITTED: &str = "replay_consumer_offsets_committed_total";
pub const OFFSET_COMMIT_ERRORS: &str = "replay_consumer_offset_commit_errors_total";

// Buffered runtime
pub const BUFFER_FLUSHES: &str = "replay_buffer_flushes_total";
pub const BUFFER_FLUSH_DURATION_MS: &str = "replay_buffer_flush_duration_ms";
pub const BUFFER_FLUSH_ITEMS: &str = "replay_buffer_flush_items";
pub const BUFFER_FLUSH_BYTES: &str = "replay_buffer_flush_bytes";

// Committers
pub const COMMIT_DURATION_MS: &str = "replay_commit_duration_ms";
pub const COMMIT_ERRORS: &str = "replay_commit_errors_total";
pub const COMMIT_WORKERS: &str = "replay_commit_workers";
pub const MERGED_BUFFER_BYTES: &str = "replay_merged_buffer_bytes";
pub const RECORDING_SEGMENTS: &str = "replay_recording_segments_total";
pub const RECORDING_SEGMENT_BYTES: &str = "replay_recording_segment_bytes";
pub const RECORDING_UNCOMPRESSED_BYTES: &str = "replay_recording_uncompressed_bytes";
pub const RECORDING_DEAD_CLICKS: &str = "replay_recording_dead_clicks_total";
pub const RECORDING_RAGE_CLICKS: &str = "replay_recording_rage_clicks_total";
pub const BILLING_OUTCOMES: &str = "replay_billing_outcomes_total";

// Process pool strategy
pub const POOL_IN_FLIGHT: &str = "replay_pool_in_flight";
pub const POOL_TASK_FAILURES: &str = "replay_pool_task_failures_total";
pub const POOL_MESSAGES_REJECTED: &str = "replay_pool_messages_rejected_total";
pub const POOL_JOIN_ABANDONED: &str = "replay_pool_join_abandoned_total";

// Publisher
pub const PUBLISHER_MESSAGES: &str = "replay_publisher_messages_total";
pub const PUBLISHER_FLUSH_DURATION_MS: &str = "replay_publisher_flush_duration_ms";

// Blob storage
pub const BLOB_STORE_OPERATIONS: &str = "replay_blob_store_operations_total";
pub const BLOB_STORE_DURATION_MS: &str = "replay_blob_store_duration_ms";

// Query path
pub const QUERY_REQUESTS: &str = "replay_query_requests_total";
pub const QUERY_DURATION_MS: &str = "replay_query_duration_ms";
pub const QUERY_SAMPLE_RATE: &str = "replay_query_sample_rate";
