//! Rate limiting, backoff, and cooperative cancellation for LLM calls.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{Error, Result};

/// Sender half of a cancellation pair.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every flag cloned from this pair.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of a cancellation pair; cheap to clone.
#[derive(Clone)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
    // Keeps an uncancellable flag's sender alive.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelFlag {
    /// A flag that can never be cancelled, for callers without an operator.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Bail out early if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning `Err(Cancelled)` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return Err(Error::Cancelled);
        }
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = rx.changed() => {
                    match changed {
                        Ok(()) if *rx.borrow() => return Err(Error::Cancelled),
                        Ok(()) => {}
                        // Handle dropped: nothing can cancel us any more.
                        Err(_) => {
                            sleep.as_mut().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Create a linked cancel handle and flag.
pub fn cancel_pair() -> (CancelHandle, CancelFlag) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx },
        CancelFlag {
            rx,
            _keepalive: None,
        },
    )
}

/// Enforces a minimum delay between consecutive calls.
pub struct Throttle {
    min_delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until at least `min_delay` has passed since the previous call.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Only transient errors ([`Error::is_transient`]) are retried; the cancel
/// flag is consulted before each attempt and during backoff sleeps.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    initial_delay: Duration,
    cancel: &CancelFlag,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    for attempt in 1..=max_attempts {
        cancel.check()?;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    "Rate limited, retrying in {:.1}s (attempt {}/{})",
                    delay.as_secs_f64(),
                    attempt,
                    max_attempts
                );
                cancel.sleep(delay).await?;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Internal("retry loop exhausted without result".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spaces_calls() {
        let throttle = Throttle::new(Duration::from_millis(500));
        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let attempts = AtomicU32::new(0);
        let cancel = CancelFlag::never();
        let result = retry_with_backoff(3, Duration::from_millis(100), &cancel, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::rate_limited("test", "busy"))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        tokio::time::pause();
        let cancel = CancelFlag::never();
        let result: Result<()> = retry_with_backoff(2, Duration::from_millis(10), &cancel, || async {
            Err(Error::rate_limited("test", "busy"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_fatal_errors() {
        let attempts = AtomicU32::new(0);
        let cancel = CancelFlag::never();
        let result: Result<()> = retry_with_backoff(3, Duration::from_millis(10), &cancel, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Llm("parse failure".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_sleep() {
        let (handle, flag) = cancel_pair();
        handle.cancel();
        let err = flag.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_retry_checks_cancel_between_attempts() {
        let (handle, flag) = cancel_pair();
        handle.cancel();
        let result: Result<()> = retry_with_backoff(3, Duration::from_millis(10), &flag, || async {
            Err(Error::rate_limited("test", "busy"))
        })
        .await;
        assert!(matches!(result.unwrap_err(), Error::Cancelled));
    }
}
