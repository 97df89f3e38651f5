//! Cooperative cancellation context threaded through every operation.
//!
//! Every suspension point (catalog lookups, pulls, VMM spawns, store writes)
//! checks the context before and during blocking work. Cloning a context
//! shares the underlying cancellation flag, so cancelling any clone cancels
//! them all.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, UnikitError};

/// Cancellation token with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that shares this one's cancellation flag but also
    /// expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    /// Marks this context (and every clone of it) as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the context has been cancelled or its deadline has passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns `Err(Canceled)` if the context is no longer live.
    ///
    /// # Errors
    ///
    /// Returns [`UnikitError::Canceled`] when cancelled or expired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UnikitError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Sleeps in short slices so cancellation is observed promptly.
    ///
    /// # Errors
    ///
    /// Returns [`UnikitError::Canceled`] if the context is cancelled before
    /// the full duration elapses.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        const SLICE: Duration = Duration::from_millis(50);
        let end = Instant::now() + duration;
        while Instant::now() < end {
            self.check()?;
            std::thread::sleep(SLICE.min(end.saturating_duration_since(Instant::now())));
        }
        self.check()
    }
}
