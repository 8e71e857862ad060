//! Time provider abstraction.
//!
//! Deadlines and last-seen timestamps go through [`TimeProvider`] so that
//! tests can run against a paused tokio clock.

use std::time::Duration;

use async_trait::async_trait;

/// Provider trait for time operations.
///
/// `now()` is the elapsed time since the provider was created. Only
/// differences between two `now()` values are meaningful.
#[async_trait]
pub trait TimeProvider: Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Elapsed time since provider creation.
    fn now(&self) -> Duration;
}

/// Time provider backed by tokio's clock.
///
/// Uses [`tokio::time::Instant`], which honours `tokio::time::pause()`.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}
