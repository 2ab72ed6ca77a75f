//! Call context - cancellation and deadlines for blocking operations
//!
//! Every operation that can block (queue push/pull, window waits, ledger
//! subscriptions) takes a `CallContext` and returns `Canceled` when the token
//! fires or the deadline passes.

use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a blocking operation returned early
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canceled {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an existing token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Same cancellation, deadline tightened to `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context: cancelled with its parent, but cancelling it leaves the
    /// parent untouched
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

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail fast if the context is already done
    pub fn check(&self) -> Result<(), Canceled> {
        if self.token.is_cancelled() {
            return Err(Canceled::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(Canceled::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the token fires or the deadline passes
    pub async fn done(&self) -> Canceled {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Canceled::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Canceled::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Canceled::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Canceled> {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }

    /// Cancelable sleep
    pub async fn sleep(&self, duration: Duration) -> Result<(), Canceled> {
        self.run(tokio::time::sleep(duration)).await
    }
}
