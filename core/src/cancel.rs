// Cooperative cancellation for long-running volume operations

use crate::VolumeError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag checked by the engine between consistent steps
/// (between two file relocations, between cluster batches).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), VolumeError> {
        if self.is_cancelled() {
            Err(VolumeError::UserCancelled)
        } else {
            Ok(())
        }
    }
}
