//! Cooperative cancellation shared between a long-running workflow and its caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A flag polled at loop heads and after every wait. Setting it never
/// interrupts an in-flight sleep; the holder notices on its next check.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arm the flag before starting a new workflow
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}
