//! Process-wide pause flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether scheduling is paused for maintenance
///
/// Cheap to clone; every clone observes the same flag. Reads always see the
/// latest write.
#[derive(Clone, Debug, Default)]
pub struct PauseState {
    paused: Arc<AtomicBool>,
}

impl PauseState {
    /// Create a flag with the given initial value
    pub fn new(paused: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(paused)),
        }
    }

    /// Current value
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Set the flag, returning the previous value
    pub fn set(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst)
    }
}
