//! Retry policies for flood waits and transient network failures.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

/// Controls how the client reacts when an RPC call fails, and how long the
/// connection supervisor waits between reconnect attempts.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    pub fail_count: NonZeroU32,
    pub slept_so_far: Duration,
    pub error: InvocationError,
}

/// Never retry.
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep through short flood waits and back off exponentially on network
/// failures.
#[derive(Clone, Debug)]
pub struct AutoSleep {
    /// Flood waits up to this long are slept through; longer ones surface
    /// as [`InvocationError::FloodWait`].
    pub flood_sleep_threshold: Duration,
    /// Give up after this many consecutive failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    pub backoff_cap: Duration,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            flood_sleep_threshold: Duration::from_secs(60),
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl AutoSleep {
    /// Delay before the `attempt`-th retry (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1).saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        let attempt = ctx.fail_count.get();
        if attempt > self.max_retries {
            return ControlFlow::Break(());
        }
        if let Some(secs) = ctx.error.flood_wait_seconds() {
            let wait = Duration::from_secs(u64::from(secs));
            if wait <= self.flood_sleep_threshold {
                tracing::info!("[tgcore] FLOOD_WAIT_{secs}: sleeping before retry");
                return ControlFlow::Continue(wait);
            }
            return ControlFlow::Break(());
        }
        if ctx.error.is_network() {
            let delay = self.backoff(attempt);
            tracing::info!("[tgcore] {}: retrying in {delay:?} (attempt {attempt})", ctx.error);
            return ControlFlow::Continue(delay);
        }
        ControlFlow::Break(())
    }
}
