use serde::{Deserialize, Serialize};

/// Configuration for individual workers in the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Prefix for worker ids; the pool appends the process id and index.
    pub worker_group: String,
    /// Polling interval when no work is available, in milliseconds.
    pub poll_interval_ms: u64,
    /// Backoff after a broker error, in milliseconds.
    pub backoff_ms: u64,
    /// How long a dequeued job stays leased before it can be reclaimed.
    pub lease_ttl_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_group: "lantern".to_string(),
            poll_interval_ms: 50,
            backoff_ms: 500,
            lease_ttl_secs: 300,
        }
    }
}
