// ==== Gate metrics ====
/// Counter for admission outcomes, labelled by source kind and outcome (admitted/duplicate/failed)
pub const ADMISSION_OUTCOME_COUNTER: &str = "ingest_admission_outcome_total";

/// Histogram for the time one admission takes, hash to decision
pub const ADMISSION_DURATION_HISTOGRAM: &str = "ingest_admission_duration_seconds";

/// Counter for hash conflicts whose existing row could not be found
pub const ADMISSION_INCONSISTENT_COUNTER: &str = "ingest_admission_inconsistent_total";

// ==== Driver metrics ====
/// Counter for storage errors retried by the driver
pub const STORAGE_RETRY_COUNTER: &str = "ingest_storage_retries_total";

/// Counter for batches reaching a terminal state, labelled by status
pub const BATCH_FINISHED_COUNTER: &str = "ingest_batches_finished_total";

/// Gauge for batches currently running in this process
pub const BATCHES_RUNNING_GAUGE: &str = "ingest_batches_running";

/// Histogram for the wall time of a whole batch
pub const BATCH_DURATION_HISTOGRAM: &str = "ingest_batch_duration_seconds";

// ==== Publisher metrics ====
/// Counter for publish attempts, labelled by destination and result
pub const PUBLISH_ATTEMPT_COUNTER: &str = "ingest_publish_attempts_total";

/// Counter for records that reached published
pub const PUBLISHED_COUNTER: &str = "ingest_published_total";

/// Counter for records that exhausted their retries
pub const PUBLISH_EXHAUSTED_COUNTER: &str = "ingest_publish_exhausted_total";

/// Counter for dead-letter hand-offs, labelled by result
pub const DEAD_LETTER_COUNTER: &str = "ingest_dead_letter_total";

/// Histogram for broker acknowledgement latency
pub const PRODUCER_SEND_DURATION_HISTOGRAM: &str = "ingest_producer_send_duration_seconds";

/// Counter for pending records re-enqueued at startup
pub const REQUEUED_PENDING_COUNTER: &str = "ingest_requeued_pending_total";

// ==== HTTP metrics ====
/// Counter for API requests, labelled by method, route template and status
pub const HTTP_REQUESTS_COUNTER: &str = "http_requests_total";

/// Histogram for API request latency, same labels as the counter
pub const HTTP_REQUEST_DURATION_HISTOGRAM: &str = "http_requests_duration_seconds";
