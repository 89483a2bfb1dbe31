//! Consecutive-error circuit breaker
//!
//! The breaker has two states. While **closed**, calls pass straight through.
//! When `error_threshold` errors are reported, each within `timeout` of the
//! previous one, it **opens** and every call fails fast with
//! [`BreakerError::Open`]. After `timeout` it closes again unconditionally;
//! there is no half-open probe.
//!
//! The breaker never looks at the result of the guarded call. Callers report
//! failures themselves through [`Breaker::error`].
//!
//! ```rust,ignore
//! let breaker = Breaker::new(5, Duration::from_secs(1));
//!
//! match breaker.run_async(|| client.publish(&msg)).await {
//!     Ok(Ok(())) => {}
//!     Ok(Err(_)) => breaker.error(),
//!     Err(BreakerError::Open) => { /* skipped, backend is resting */ }
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerState {
    mode: BreakerMode,
    consecutive_errors: u32,
    last_error: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    error_threshold: u32,
    timeout: Duration,
    /// Mirror of `state.mode == Open` for the lock-free path in `run`
    open: AtomicBool,
    state: Mutex<BreakerState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut state = self.lock_state();
        state.mode = BreakerMode::Closed;
        state.consecutive_errors = 0;
        self.open.store(false, Ordering::Release);
        info!("Circuit breaker closed");
    }
}

/// Shared handle; clones refer to the same breaker
#[derive(Debug, Clone)]
pub struct Breaker {
    inner: Arc<Inner>,
}

impl Breaker {
    pub fn new(error_threshold: u32, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                error_threshold: error_threshold.max(1),
                timeout,
                open: AtomicBool::new(false),
                state: Mutex::new(BreakerState {
                    mode: BreakerMode::Closed,
                    consecutive_errors: 0,
                    last_error: None,
                }),
            }),
        }
    }

    /// Run `action` unless the breaker is open
    pub fn run<T>(&self, action: impl FnOnce() -> T) -> Result<T, BreakerError> {
        if self.is_open() {
            return Err(BreakerError::Open);
        }
        Ok(action())
    }

    /// Async form of [`Breaker::run`]; the future is not created when open
    pub async fn run_async<F, Fut, T>(&self, action: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_open() {
            return Err(BreakerError::Open);
        }
        Ok(action().await)
    }

    /// Register a failed call, possibly opening the breaker
    ///
    /// Errors spaced further apart than `timeout` do not accumulate. Calls made
    /// while open are ignored and do not extend the open period.
    pub fn error(&self) {
        let mut state = self.inner.lock_state();
        let now = Instant::now();

        if state.consecutive_errors > 0 {
            if let Some(last) = state.last_error {
                if now.duration_since(last) >= self.inner.timeout {
                    state.consecutive_errors = 0;
                }
            }
        }

        if state.mode == BreakerMode::Open {
            return;
        }

        state.consecutive_errors += 1;
        if state.consecutive_errors >= self.inner.error_threshold {
            state.mode = BreakerMode::Open;
            state.consecutive_errors = 0;
            self.inner.open.store(true, Ordering::Release);
            warn!(
                threshold = self.inner.error_threshold,
                timeout_ms = self.inner.timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            self.schedule_close();
        } else {
            state.last_error = Some(now);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> BreakerMode {
        self.inner.lock_state().mode
    }

    fn schedule_close(&self) {
        let inner = Arc::clone(&self.inner);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(inner.timeout).await;
                    inner.close();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(inner.timeout);
                    inner.close();
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_breaker_starts_closed() {
        let breaker = Breaker::new(2, Duration::from_millis(100));

        assert_eq!(breaker.run(|| 42), Ok(42));
        assert_eq!(breaker.mode(), BreakerMode::Closed);
    }

    #[tokio::test]
    async fn test_spaced_errors_do_not_accumulate() {
        let breaker = Breaker::new(2, Duration::from_millis(100));

        for _ in 0..3 {
            breaker.error();
            sleep(Duration::from_millis(110)).await;
        }

        assert!(breaker.run(|| ()).is_ok());
    }

    #[tokio::test]
    async fn test_opens_at_threshold_and_closes_after_timeout() {
        let breaker = Breaker::new(2, Duration::from_millis(100));
        let calls = AtomicUsize::new(0);

        breaker.error();
        assert!(!breaker.is_open());
        breaker.error();
        assert!(breaker.is_open());

        let result = breaker.run(|| calls.fetch_add(1, Ordering::SeqCst));
        assert_eq!(result, Err(BreakerError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(200)).await;

        assert!(breaker.run(|| calls.fetch_add(1, Ordering::SeqCst)).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.mode(), BreakerMode::Closed);
    }

    #[tokio::test]
    async fn test_errors_while_open_do_not_extend() {
        let breaker = Breaker::new(1, Duration::from_millis(100));

        breaker.error();
        assert!(breaker.is_open());

        sleep(Duration::from_millis(60)).await;
        breaker.error();
        breaker.error();

        sleep(Duration::from_millis(80)).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_count_resets_after_reclose() {
        let breaker = Breaker::new(2, Duration::from_millis(50));

        breaker.error();
        breaker.error();
        sleep(Duration::from_millis(100)).await;
        assert!(!breaker.is_open());

        breaker.error();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_run_async_skips_future_when_open() {
        let breaker = Breaker::new(1, Duration::from_secs(10));
        breaker.error();

        let mut created = false;
        let result = breaker
            .run_async(|| {
                created = true;
                async { 1 }
            })
            .await;

        assert_eq!(result, Err(BreakerError::Open));
        assert!(!created);
    }

    #[test]
    fn test_closes_without_runtime() {
        let breaker = Breaker::new(1, Duration::from_millis(20));
        breaker.error();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(100));
        assert!(!breaker.is_open());
    }
}
