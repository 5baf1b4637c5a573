//! Cancellation and deadline guard for suspension points.
//!
//! Every await on an external collaborator goes through [`CallGuard::run`],
//! which races the call against the caller's cancellation token and the
//! context deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a compilation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    /// The caller cancelled.
    #[error("Compilation cancelled")]
    Cancelled,
    /// The context deadline passed.
    #[error("Compilation deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone)]
pub struct CallGuard {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallGuard {
    /// Create a guard; the deadline starts now.
    pub fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A guard that never fires.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    /// Fail fast if already cancelled or past the deadline.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run a future unless cancellation or the deadline fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupted::DeadlineExceeded),
                out = fut => Ok(out),
            },
            None => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Interrupted::Cancelled),
                out = fut => Ok(out),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_through() {
        let guard = CallGuard::unbounded();
        assert_eq!(guard.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let token = CancellationToken::new();
        token.cancel();
        let guard = CallGuard::new(token, None);
        assert_eq!(guard.run(async { 7 }).await, Err(Interrupted::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let guard = CallGuard::new(CancellationToken::new(), Some(Duration::from_secs(1)));
        let slow = tokio::time::sleep(Duration::from_secs(5));
        assert_eq!(guard.run(slow).await, Err(Interrupted::DeadlineExceeded));
    }
}
