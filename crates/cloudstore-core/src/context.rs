//! Cancellation and deadline context for store operations

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Carries a cancellation signal and an optional deadline into every
/// remote or disk-heavy operation.
///
/// An aborted operation leaves nothing committed: the wrapped future is
/// dropped before it can finish.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl OpContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Context driven by an existing cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Same cancellation signal, with a deadline `timeout` from now
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            token: self.token.clone(),
            deadline: Instant::now().checked_add(timeout).map(|at| (at, timeout)),
        }
    }

    /// Derived context that is cancelled with this one but can be
    /// cancelled on its own too
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail fast if the context is already done
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }
        if let Some((deadline, timeout)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Run `fut` until it completes, the context is cancelled or the
    /// deadline passes, whichever comes first.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(%operation, "Operation cancelled");
                    Err(Error::Cancelled {
                        operation: operation.to_string(),
                    })
                }
                result = fut => result,
            }
        };

        match self.deadline {
            Some((deadline, timeout)) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or_else(|_| {
                    debug!(%operation, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
                    Err(Error::Timeout {
                        operation: operation.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }),
            None => guarded.await,
        }
    }
}
