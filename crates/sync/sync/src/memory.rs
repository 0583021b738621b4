use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use crate::backend::SyncBackend;
use crate::error::SyncError;
use crate::registry;

/// Internal record for a held lock.
#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process [`SyncBackend`] backed by a [`DashMap`].
///
/// This is the reference implementation of the contract's semantics. Expiry
/// is lazy: an expired entry is treated as absent and replaced in place on
/// the next acquire for the same name. Per-name atomicity comes from the
/// map's entry API, which holds the shard lock for the whole test-and-set.
#[derive(Debug, Default)]
pub struct MemorySyncBackend {
    locks: DashMap<String, LockEntry>,
    opened: AtomicBool,
}

impl MemorySyncBackend {
    /// Create a new in-memory backend.
    ///
    /// With `auto_register` the backend publishes itself as the
    /// process-wide default lock backend.
    pub fn new(auto_register: bool) -> Arc<Self> {
        let backend = Arc::new(Self::default());
        if auto_register {
            registry::register_lock_backend(backend.clone());
        }
        backend
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), SyncError> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SyncError::OutOfContext { operation })
        }
    }
}

#[async_trait]
impl SyncBackend for MemorySyncBackend {
    async fn open(&self) -> Result<(), SyncError> {
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), SyncError> {
        self.opened.store(false, Ordering::Release);
        self.locks.clear();
        Ok(())
    }

    async fn acquire(
        &self,
        name: &str,
        token: &str,
        duration: Duration,
    ) -> Result<bool, SyncError> {
        self.ensure_open("acquire")?;
        let expires_at = Instant::now() + duration;

        match self.locks.entry(name.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                if entry.token == token || entry.is_expired() {
                    occupied.insert(LockEntry {
                        token: token.to_owned(),
                        expires_at,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    token: token.to_owned(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, SyncError> {
        self.ensure_open("release")?;
        let removed = self
            .locks
            .remove_if(name, |_, entry| entry.token == token && !entry.is_expired());
        Ok(removed.is_some())
    }

    async fn locked(&self, name: &str) -> Result<bool, SyncError> {
        self.ensure_open("locked")?;
        Ok(self
            .locks
            .get(name)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn owned(&self, name: &str, token: &str) -> Result<bool, SyncError> {
        self.ensure_open("owned")?;
        Ok(self
            .locks
            .get(name)
            .is_some_and(|entry| entry.token == token && !entry.is_expired()))
    }
}
