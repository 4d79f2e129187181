//! Context and retry configuration.

use std::time::Duration;

/// Default number of surface headers the context keeps for reuse.
pub const DEFAULT_HEADER_CAPACITY: usize = 1024;

/// Configuration for [`BufSurfaceContext`](crate::BufSurfaceContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Maximum number of released surface headers parked for reuse.
    pub header_capacity: usize,
    /// Fill the header free list when the context is created.
    pub preallocate_headers: bool,
    /// Retry policy used by [`BufPool`](crate::BufPool).
    pub retry: RetryConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            header_capacity: DEFAULT_HEADER_CAPACITY,
            preallocate_headers: false,
            retry: RetryConfig::default(),
        }
    }
}

impl ContextConfig {
    /// Set the header free-list capacity.
    pub fn with_header_capacity(mut self, capacity: usize) -> Self {
        self.header_capacity = capacity;
        self
    }

    /// Preallocate every header up front.
    pub fn with_preallocated_headers(mut self, preallocate: bool) -> Self {
        self.preallocate_headers = preallocate;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff between retries of a refused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// First pause.
    pub initial_backoff: Duration,
    /// Longest pause; the backoff doubles up to this.
    pub max_backoff: Duration,
    /// Budget used when a [`BufPool`](crate::BufPool) is dropped.
    pub drop_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            drop_timeout: Duration::from_millis(5000),
        }
    }
}

impl RetryConfig {
    /// Set the first pause.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the drop budget.
    pub fn with_drop_timeout(mut self, timeout: Duration) -> Self {
        self.drop_timeout = timeout;
        self
    }
}
