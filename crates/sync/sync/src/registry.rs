//! Process-wide default backend selection.
//!
//! Only the lock category exists today; the enum leaves room for future
//! backend kinds without changing the registry surface.

use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::SyncBackend;
use crate::error::SyncError;

/// Categories of registrable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCategory {
    /// Distributed lock storage.
    Lock,
}

impl std::fmt::Display for BackendCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lock => write!(f, "lock"),
        }
    }
}

#[derive(Default)]
struct LoadedBackends {
    lock: Option<Arc<dyn SyncBackend>>,
}

static LOADED: Mutex<LoadedBackends> = Mutex::new(LoadedBackends { lock: None });

fn loaded() -> std::sync::MutexGuard<'static, LoadedBackends> {
    LOADED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish `backend` as the process-wide default lock backend.
///
/// A later registration replaces an earlier one.
pub fn register_lock_backend(backend: Arc<dyn SyncBackend>) {
    loaded().lock = Some(backend);
}

/// Resolve the process-wide default lock backend.
///
/// # Errors
///
/// Returns [`SyncError::BackendNotLoaded`] when none has been registered.
pub fn get_lock_backend() -> Result<Arc<dyn SyncBackend>, SyncError> {
    loaded()
        .lock
        .clone()
        .ok_or(SyncError::BackendNotLoaded(BackendCategory::Lock))
}

/// Drop every registered backend.
///
/// Intended for process teardown and test isolation.
pub fn clear() {
    loaded().lock = None;
}

/// Serializes tests that mutate the process-wide registry.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock().unwrap_or_else(PoisonError::into_inner)
}
