use std::time::Duration;

use thiserror::Error;

use crate::registry::BackendCategory;

/// Errors from synchronization backends and the primitives built on them.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No backend has been registered for the requested category.
    #[error("no {0} backend loaded, initialize one first")]
    BackendNotLoaded(BackendCategory),

    /// A backend operation was invoked before `open` or after `close`.
    #[error("backend used out of context: open it before calling `{operation}`")]
    OutOfContext {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// Settings could not be validated; `keys` lists every offending entry.
    #[error("could not validate settings: {reason} [keys: {}]", .keys.join(", "))]
    SettingsValidation {
        /// Why validation failed.
        reason: String,
        /// The offending setting keys (environment variables or fields).
        keys: Vec<String>,
    },

    /// The backend's storage could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend's storage reported an operational failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// A backend failure occurred while acquiring a lock.
    #[error("failed to acquire lock '{name}': {source}")]
    Acquire {
        /// The lock name.
        name: String,
        /// The underlying backend failure.
        source: Box<SyncError>,
    },

    /// A backend failure occurred while releasing a lock.
    #[error("failed to release lock '{name}': {source}")]
    Release {
        /// The lock name.
        name: String,
        /// The underlying backend failure.
        source: Box<SyncError>,
    },

    /// A release was attempted against a record that is expired or held by
    /// a different token.
    #[error("lock '{name}' is not owned: already expired or taken by another holder")]
    NotOwned {
        /// The lock name.
        name: String,
    },

    /// A waiting acquisition did not succeed before its deadline.
    #[error("timed out acquiring lock '{name}' after {timeout:?}")]
    AcquireTimeout {
        /// The lock name.
        name: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

impl SyncError {
    /// Wrap a backend failure as an acquire error for `name`.
    pub(crate) fn acquire(name: &str, source: SyncError) -> Self {
        Self::Acquire {
            name: name.to_owned(),
            source: Box::new(source),
        }
    }

    /// Wrap a backend failure as a release error for `name`.
    pub(crate) fn release(name: &str, source: SyncError) -> Self {
        Self::Release {
            name: name.to_owned(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_validation_lists_offending_keys() {
        let err = SyncError::SettingsValidation {
            reason: "missing required settings".into(),
            keys: vec!["POSTGRES_HOST".into(), "POSTGRES_PORT".into()],
        };
        let message = err.to_string();
        assert!(message.contains("POSTGRES_HOST"));
        assert!(message.contains("POSTGRES_PORT"));
    }

    #[test]
    fn acquire_error_preserves_source() {
        let err = SyncError::acquire("orders", SyncError::Connection("refused".into()));
        assert!(err.to_string().contains("orders"));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn backend_not_loaded_names_category() {
        let err = SyncError::BackendNotLoaded(BackendCategory::Lock);
        assert!(err.to_string().contains("lock"));
    }
}
