use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::SyncBackend;
use crate::error::SyncError;
use crate::registry;

/// Default lease passed to the backend on each acquire.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Default polling interval for waiting acquisitions.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// User-facing distributed lock over any [`SyncBackend`].
///
/// Each instance manages its own holder token: a cold acquire mints a fresh
/// random token, a reentrant acquire while held extends the same token, and
/// a release clears it so the next acquire starts cold again. The backend is
/// either pinned at construction or resolved lazily from the process-wide
/// registry on first use.
pub struct Lock {
    name: String,
    lease_duration: Duration,
    retry_interval: Duration,
    backend: OnceLock<Arc<dyn SyncBackend>>,
    token: Mutex<Option<String>>,
    runtime: OnceLock<Handle>,
}

impl Lock {
    /// Create a lock resolving its backend from the registry at first use.
    pub fn new(name: impl Into<String>) -> Self {
        let lock = Self {
            name: name.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            backend: OnceLock::new(),
            token: Mutex::new(None),
            runtime: OnceLock::new(),
        };
        lock.note_runtime();
        lock
    }

    /// Create a lock pinned to an explicit backend.
    pub fn with_backend(name: impl Into<String>, backend: Arc<dyn SyncBackend>) -> Self {
        let lock = Self::new(name);
        let _ = lock.backend.set(backend);
        lock
    }

    /// Override the lease passed to the backend on each acquire.
    ///
    /// When the lock is renewed on a heartbeat, pick a lease of at least
    /// twice the heartbeat interval so one missed beat does not drop it.
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Override the polling interval used by waiting acquisitions.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remember the ambient runtime for the blocking-thread surface.
    fn note_runtime(&self) {
        if self.runtime.get().is_none() {
            if let Ok(handle) = Handle::try_current() {
                let _ = self.runtime.set(handle);
            }
        }
    }

    fn backend(&self) -> Result<Arc<dyn SyncBackend>, SyncError> {
        if let Some(backend) = self.backend.get() {
            return Ok(backend.clone());
        }
        let backend = registry::get_lock_backend()?;
        let _ = self.backend.set(backend.clone());
        Ok(backend)
    }

    fn token_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The held token, or a freshly minted one for a cold acquire.
    fn current_or_minted_token(&self) -> String {
        self.token_slot()
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
    }

    fn take_token(&self) -> Option<String> {
        self.token_slot().take()
    }

    /// Attempt a single, fail-fast acquisition.
    ///
    /// # Errors
    ///
    /// Backend failures surface as [`SyncError::Acquire`].
    pub async fn try_acquire(&self) -> Result<bool, SyncError> {
        self.note_runtime();
        let backend = self.backend()?;
        let token = self.current_or_minted_token();

        match backend
            .acquire(&self.name, &token, self.lease_duration)
            .await
        {
            Ok(true) => {
                *self.token_slot() = Some(token);
                Ok(true)
            }
            Ok(false) => {
                // A held token that no longer acquires means the lease was
                // lost to another holder.
                *self.token_slot() = None;
                Ok(false)
            }
            Err(source) => Err(SyncError::acquire(&self.name, source)),
        }
    }

    /// Acquire, polling every `retry_interval` until success or `timeout`.
    ///
    /// Returns `Ok(false)` when the deadline elapses; waits indefinitely
    /// when `timeout` is `None`.
    ///
    /// # Errors
    ///
    /// Backend failures surface as [`SyncError::Acquire`].
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.try_acquire().await? {
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    sleep(self.retry_interval.min(deadline - now)).await;
                }
                None => sleep(self.retry_interval).await,
            }
        }
    }

    /// Release the lock if this instance holds it.
    ///
    /// Releasing a record that is expired or held by someone else is not an
    /// error: it usually means the lease was lost, so it is logged at WARN
    /// and swallowed. The token is cleared either way; the next acquire is
    /// cold.
    ///
    /// # Errors
    ///
    /// Backend failures surface as [`SyncError::Release`]; the token is kept
    /// so the release can be retried.
    pub async fn release(&self) -> Result<(), SyncError> {
        self.note_runtime();
        let backend = self.backend()?;
        let Some(token) = self.take_token() else {
            debug!(lock = %self.name, "release without a held token, nothing to do");
            return Ok(());
        };

        match backend.release(&self.name, &token).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                let error = SyncError::NotOwned {
                    name: self.name.clone(),
                };
                warn!(lock = %self.name, %error, "released a lock this instance no longer owns");
                Ok(())
            }
            Err(source) => {
                *self.token_slot() = Some(token);
                Err(SyncError::release(&self.name, source))
            }
        }
    }

    /// Whether a live record exists for this name, held by anyone.
    ///
    /// # Errors
    ///
    /// Backend failures surface unchanged.
    pub async fn locked(&self) -> Result<bool, SyncError> {
        self.note_runtime();
        self.backend()?.locked(&self.name).await
    }

    /// Whether this instance currently holds the lock.
    ///
    /// # Errors
    ///
    /// Backend failures surface unchanged.
    pub async fn owned(&self) -> Result<bool, SyncError> {
        self.note_runtime();
        let token = self.token_slot().clone();
        match token {
            Some(token) => self.backend()?.owned(&self.name, &token).await,
            None => Ok(false),
        }
    }

    /// Fail-fast scoped acquisition.
    ///
    /// # Errors
    ///
    /// Backend failures surface as [`SyncError::Acquire`].
    pub async fn try_guard(&self) -> Result<Option<LockGuard<'_>>, SyncError> {
        if self.try_acquire().await? {
            Ok(Some(LockGuard {
                lock: self,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Waiting scoped acquisition with an optional overall deadline.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AcquireTimeout`] when the deadline elapses;
    /// backend failures surface as [`SyncError::Acquire`].
    pub async fn guard(&self, timeout: Option<Duration>) -> Result<LockGuard<'_>, SyncError> {
        if self.acquire(timeout).await? {
            Ok(LockGuard {
                lock: self,
                released: false,
            })
        } else {
            Err(SyncError::AcquireTimeout {
                name: self.name.clone(),
                timeout: timeout.unwrap_or_default(),
            })
        }
    }

    /// Companion surface for threads that are not running the event loop.
    ///
    /// The companion drives the same instance and token through
    /// [`Handle::block_on`]. It requires that this lock has observed a
    /// multi-threaded runtime (any async call or construction inside one);
    /// otherwise its methods fail with [`SyncError::OutOfContext`].
    pub fn from_thread(&self) -> LockFromThread<'_> {
        LockFromThread { lock: self }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

/// A held scoped lock.
///
/// Prefer explicit [`release`](Self::release). Dropping the guard spawns a
/// best-effort release on the ambient runtime; without one the lease TTL is
/// the backstop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a Lock,
    released: bool,
}

impl LockGuard<'_> {
    /// Release the lock now.
    ///
    /// # Errors
    ///
    /// Backend failures surface as [`SyncError::Release`].
    pub async fn release(mut self) -> Result<(), SyncError> {
        self.released = true;
        self.lock.release().await
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(token) = self.lock.take_token() else {
            return;
        };
        let Ok(backend) = self.lock.backend() else {
            return;
        };
        if let Ok(handle) = Handle::try_current() {
            let name = self.lock.name.clone();
            handle.spawn(async move {
                if let Err(error) = backend.release(&name, &token).await {
                    debug!(lock = %name, %error, "best-effort release on guard drop failed");
                }
            });
        }
    }
}

/// Blocking-thread surface of a [`Lock`].
///
/// Obtained from [`Lock::from_thread`]; see there for the runtime
/// requirements.
#[derive(Debug)]
pub struct LockFromThread<'a> {
    lock: &'a Lock,
}

impl LockFromThread<'_> {
    fn handle(&self) -> Result<Handle, SyncError> {
        self.lock
            .runtime
            .get()
            .cloned()
            .ok_or(SyncError::OutOfContext {
                operation: "from_thread",
            })
    }

    /// Blocking form of [`Lock::try_acquire`].
    pub fn try_acquire(&self) -> Result<bool, SyncError> {
        self.handle()?.block_on(self.lock.try_acquire())
    }

    /// Blocking form of [`Lock::acquire`].
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        self.handle()?.block_on(self.lock.acquire(timeout))
    }

    /// Blocking form of [`Lock::release`].
    pub fn release(&self) -> Result<(), SyncError> {
        self.handle()?.block_on(self.lock.release())
    }

    /// Blocking form of [`Lock::locked`].
    pub fn locked(&self) -> Result<bool, SyncError> {
        self.handle()?.block_on(self.lock.locked())
    }

    /// Blocking form of [`Lock::owned`].
    pub fn owned(&self) -> Result<bool, SyncError> {
        self.handle()?.block_on(self.lock.owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySyncBackend;

    async fn open_backend() -> Arc<MemorySyncBackend> {
        let backend = MemorySyncBackend::new(false);
        backend.open().await.expect("open should succeed");
        backend
    }

    #[tokio::test]
    async fn acquire_then_introspect() {
        let backend = open_backend().await;
        let lock = Lock::with_backend("orders", backend);

        assert!(lock.try_acquire().await.unwrap());
        assert!(lock.owned().await.unwrap());
        assert!(lock.locked().await.unwrap());

        lock.release().await.unwrap();
        assert!(!lock.owned().await.unwrap());
        assert!(!lock.locked().await.unwrap());
    }

    #[tokio::test]
    async fn reentrant_acquire_from_same_instance() {
        let backend = open_backend().await;
        let lock = Lock::with_backend("orders", backend);

        assert!(lock.try_acquire().await.unwrap());
        assert!(lock.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn mutual_exclusion_between_instances() {
        let backend = open_backend().await;
        let first = Lock::with_backend("orders", backend.clone());
        let second = Lock::with_backend("orders", backend);

        assert!(first.try_acquire().await.unwrap());
        assert!(!second.try_acquire().await.unwrap());
        assert!(!second.owned().await.unwrap());

        first.release().await.unwrap();
        assert!(second.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn release_without_holding_is_silent() {
        let backend = open_backend().await;
        let lock = Lock::with_backend("orders", backend);

        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_release_does_not_steal() {
        let backend = open_backend().await;
        let holder = Lock::with_backend("orders", backend.clone());
        let stranger = Lock::with_backend("orders", backend);

        assert!(holder.try_acquire().await.unwrap());

        // The stranger never acquired; its release is a logged no-op.
        stranger.release().await.unwrap();
        assert!(holder.owned().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquire_times_out() {
        let backend = open_backend().await;
        let holder = Lock::with_backend("orders", backend.clone());
        let waiter = Lock::with_backend("orders", backend).retry_interval(Duration::from_millis(10));

        assert!(holder.try_acquire().await.unwrap());
        let acquired = waiter.acquire(Some(Duration::from_millis(100))).await.unwrap();
        assert!(!acquired, "waiter should give up at the deadline");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquire_succeeds_after_expiry() {
        let backend = open_backend().await;
        let holder = Lock::with_backend("orders", backend.clone())
            .lease_duration(Duration::from_millis(50));
        let waiter = Lock::with_backend("orders", backend)
            .retry_interval(Duration::from_millis(10));

        assert!(holder.try_acquire().await.unwrap());
        let acquired = waiter.acquire(Some(Duration::from_secs(1))).await.unwrap();
        assert!(acquired, "waiter should take over once the lease expires");
        assert!(!holder.owned().await.unwrap());
    }

    #[tokio::test]
    async fn guard_releases_explicitly() {
        let backend = open_backend().await;
        let lock = Lock::with_backend("orders", backend.clone());

        let guard = lock.guard(None).await.unwrap();
        assert!(backend.locked("orders").await.unwrap());
        guard.release().await.unwrap();
        assert!(!backend.locked("orders").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn guard_drop_spawns_release() {
        let backend = open_backend().await;
        let lock = Lock::with_backend("orders", backend.clone());

        let guard = lock.try_guard().await.unwrap().expect("should acquire");
        drop(guard);

        // The drop release runs as a spawned task.
        for _ in 0..50 {
            if !backend.locked("orders").await.unwrap() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("guard drop should have released the lock");
    }

    #[tokio::test]
    async fn try_guard_fails_fast_when_contended() {
        let backend = open_backend().await;
        let holder = Lock::with_backend("orders", backend.clone());
        let other = Lock::with_backend("orders", backend);

        assert!(holder.try_acquire().await.unwrap());
        assert!(other.try_guard().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn guard_timeout_surfaces_as_error() {
        let backend = open_backend().await;
        let holder = Lock::with_backend("orders", backend.clone());
        let other = Lock::with_backend("orders", backend)
            .retry_interval(Duration::from_millis(5));

        assert!(holder.try_acquire().await.unwrap());
        let err = other
            .guard(Some(Duration::from_millis(30)))
            .await
            .expect_err("contended guard should time out");
        assert!(matches!(err, SyncError::AcquireTimeout { .. }));
    }

    #[tokio::test]
    async fn registry_resolution_is_lazy() {
        let _guard = crate::registry::test_guard();
        crate::registry::clear();

        let lock = Lock::new("orders");
        let err = lock.try_acquire().await.expect_err("no backend registered");
        assert!(matches!(err, SyncError::BackendNotLoaded(_)));

        let backend = open_backend().await;
        crate::registry::register_lock_backend(backend);
        assert!(lock.try_acquire().await.unwrap());
        crate::registry::clear();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn from_thread_surface_round_trip() {
        let backend = open_backend().await;
        let lock = Arc::new(Lock::with_backend("orders", backend));

        let worker = {
            let lock = Arc::clone(&lock);
            tokio::task::spawn_blocking(move || {
                let companion = lock.from_thread();
                assert!(companion.try_acquire()?);
                assert!(companion.owned()?);
                companion.release()?;
                companion.locked()
            })
        };

        let still_locked = worker.await.expect("worker should not panic").unwrap();
        assert!(!still_locked);
    }
}
