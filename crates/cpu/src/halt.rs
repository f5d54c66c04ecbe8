use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-core flag asking the executor to stop at the next instruction
/// boundary and return [`HaltReason::BreakLoop`](crate::HaltReason).
#[derive(Debug, Clone, Default)]
pub struct HaltSignal(Arc<AtomicBool>);

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
