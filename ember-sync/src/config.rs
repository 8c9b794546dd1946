//! Sync configuration.

use std::time::Duration;

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cadence of the API polling loop and the SPV head check.
    pub poll_interval: Duration,
    /// First retry delay after an API failure.
    pub api_retry_base: Duration,
    /// Retry delay cap for the API back-end.
    pub api_retry_cap: Duration,
    /// First reconnect delay after a peer failure.
    pub peer_retry_base: Duration,
    /// Reconnect delay cap for the SPV back-end.
    pub peer_retry_cap: Duration,
    /// Headers requested per pipelined batch.
    pub header_batch_size: u64,
    /// Header requests kept in flight.
    pub header_pipeline_depth: usize,
    /// Records requested per transaction-index page.
    pub index_page_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            api_retry_base: Duration::from_secs(1),
            api_retry_cap: Duration::from_secs(60),
            peer_retry_base: Duration::from_secs(2),
            peer_retry_cap: Duration::from_secs(120),
            header_batch_size: 192,
            header_pipeline_depth: 3,
            index_page_size: 100,
        }
    }
}

impl SyncConfig {
    /// A configuration with short delays for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            api_retry_base: Duration::from_millis(10),
            api_retry_cap: Duration::from_millis(50),
            peer_retry_base: Duration::from_millis(10),
            peer_retry_cap: Duration::from_millis(50),
            header_batch_size: 4,
            header_pipeline_depth: 2,
            index_page_size: 5,
        }
    }
}
