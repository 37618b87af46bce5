//! Run deadlines, cancellation, and bounded waits.
//!
//! Every suspension point inside a run goes through [`RunContext::bound`], so
//! no wait can outlive the run deadline or ignore a cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use questiontree_shared::{QuestionTreeError, Result};

/// Absolute point in time after which a run must stop.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Caller side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Engine side of a cancellation signal. The default never fires.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Option<watch::Receiver<bool>>);

impl CancelFlag {
    /// Create a connected handle/flag pair.
    pub fn pair() -> (CancelHandle, CancelFlag) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelFlag(Some(rx)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once cancellation is requested; pend forever otherwise.
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.0.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling.
                return std::future::pending().await;
            }
        }
    }
}

/// Bounded retry schedule for detecting injected child nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildPoll {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ChildPoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(150),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Deadline and cancellation shared by every step of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub deadline: Deadline,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(budget: Duration, cancel: CancelFlag) -> Self {
        Self {
            deadline: Deadline::after(budget),
            cancel,
        }
    }

    /// Err if the run was cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(QuestionTreeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` with a timeout of `limit`, clipped to the run deadline.
    pub async fn bound<T, F>(&self, operation: &str, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_cancelled()?;
        let limit = limit.min(self.deadline.remaining());
        if limit.is_zero() {
            return Err(QuestionTreeError::timeout(operation, Duration::ZERO));
        }

        let mut cancel = self.cancel.clone();
        tokio::select! {
            res = tokio::time::timeout(limit, fut) => {
                res.map_err(|_| QuestionTreeError::timeout(operation, limit))?
            }
            _ = cancel.cancelled() => Err(QuestionTreeError::Cancelled),
        }
    }

    /// Sleep for `delay`, clipped to the deadline and interruptible by cancellation.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        self.check_cancelled()?;
        let delay = delay.min(self.deadline.remaining());
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(QuestionTreeError::Cancelled),
        }
    }
}
