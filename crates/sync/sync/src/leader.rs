use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::SyncBackend;
use crate::error::SyncError;
use crate::registry;

/// Timing configuration for a [`LeaderElection`].
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// TTL of the leadership lease held in the backend.
    pub lease_duration: Duration,
    /// Heartbeat interval while leading. Must stay below half the lease so
    /// one lost heartbeat does not drop it.
    pub renew_interval: Duration,
    /// Pause between attempts while another node leads.
    pub retry_interval: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl LeaderElectionConfig {
    /// Validate the interval relationships.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] naming the offending
    /// fields.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut keys = Vec::new();
        if self.lease_duration.is_zero() {
            keys.push("lease_duration".to_owned());
        }
        if self.retry_interval.is_zero() {
            keys.push("retry_interval".to_owned());
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_duration / 2 {
            keys.push("renew_interval".to_owned());
        }
        if keys.is_empty() {
            Ok(())
        } else {
            Err(SyncError::SettingsValidation {
                reason: "renew_interval must be positive and below half the lease".into(),
                keys,
            })
        }
    }
}

#[derive(Debug, Default)]
struct LeaderShared {
    is_leader: AtomicBool,
    last_renewal: Mutex<Option<Instant>>,
}

/// Continuously contends for a named leadership lease on behalf of one node.
///
/// The identity token is minted once at construction and survives backend
/// reconnects. The handle is cheaply cloneable; clones observe the same
/// leadership state, so one clone can run the loop while others answer
/// "am I leader?". Consumers must re-check [`is_leader`](Self::is_leader)
/// inside their critical section: leadership observed before an await point
/// may be gone after it.
#[derive(Clone)]
pub struct LeaderElection {
    name: String,
    token: String,
    config: LeaderElectionConfig,
    backend: OnceLock<Arc<dyn SyncBackend>>,
    shared: Arc<LeaderShared>,
}

impl LeaderElection {
    /// Create an election resolving its backend from the registry at first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] when the configured
    /// intervals are inconsistent.
    pub fn new(name: impl Into<String>, config: LeaderElectionConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            token: Uuid::new_v4().simple().to_string(),
            config,
            backend: OnceLock::new(),
            shared: Arc::new(LeaderShared::default()),
        })
    }

    /// Create an election pinned to an explicit backend.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] when the configured
    /// intervals are inconsistent.
    pub fn with_backend(
        name: impl Into<String>,
        config: LeaderElectionConfig,
        backend: Arc<dyn SyncBackend>,
    ) -> Result<Self, SyncError> {
        let election = Self::new(name, config)?;
        let _ = election.backend.set(backend);
        Ok(election)
    }

    /// The contested lease name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This node's identity token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::Acquire)
    }

    /// When the lease was last successfully acquired or renewed.
    pub fn last_renewal(&self) -> Option<Instant> {
        *self
            .shared
            .last_renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn backend(&self) -> Result<Arc<dyn SyncBackend>, SyncError> {
        if let Some(backend) = self.backend.get() {
            return Ok(backend.clone());
        }
        let backend = registry::get_lock_backend()?;
        let _ = self.backend.set(backend.clone());
        Ok(backend)
    }

    fn update_leadership(&self, acquired: bool) {
        if acquired {
            *self
                .shared
                .last_renewal
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        }
        let was_leader = self.shared.is_leader.swap(acquired, Ordering::AcqRel);
        if was_leader != acquired {
            if acquired {
                info!(group = %self.name, token = %self.token, "leadership acquired");
            } else {
                info!(group = %self.name, token = %self.token, "leadership lost");
            }
        }
    }

    /// Run the election loop until `cancel` fires.
    ///
    /// Backend failures are logged and retried on the next beat; they never
    /// end the loop. Cancellation clears leadership, attempts one
    /// best-effort release, and returns.
    pub async fn run(&self, cancel: CancellationToken) {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(error) => {
                warn!(group = %self.name, %error, "leader election cannot start");
                return;
            }
        };

        loop {
            let attempt = tokio::select! {
                () = cancel.cancelled() => break,
                result = backend.acquire(&self.name, &self.token, self.config.lease_duration) => result,
            };

            let acquired = match attempt {
                Ok(acquired) => acquired,
                Err(error) => {
                    warn!(group = %self.name, %error, "leader election backend call failed, retrying");
                    false
                }
            };
            self.update_leadership(acquired);

            let pause = if acquired {
                self.config.renew_interval
            } else {
                self.config.retry_interval
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(pause) => {}
            }
        }

        self.update_leadership(false);
        if let Err(error) = backend.release(&self.name, &self.token).await {
            debug!(group = %self.name, %error, "best-effort release on shutdown failed");
        }
    }

    /// Spawn [`run`](Self::run) on the ambient runtime.
    pub fn spawn(&self) -> LeaderElectionHandle {
        let cancel = CancellationToken::new();
        let election = self.clone();
        let child = cancel.clone();
        let join = tokio::spawn(async move { election.run(child).await });
        LeaderElectionHandle { cancel, join }
    }
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

/// Handle for a spawned election loop.
#[derive(Debug)]
pub struct LeaderElectionHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl LeaderElectionHandle {
    /// Request shutdown without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Request shutdown and wait for the loop to finish its teardown.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySyncBackend;

    fn fast_config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: Duration::from_millis(300),
            renew_interval: Duration::from_millis(50),
            retry_interval: Duration::from_millis(50),
        }
    }

    async fn open_backend() -> Arc<MemorySyncBackend> {
        let backend = MemorySyncBackend::new(false);
        backend.open().await.expect("open should succeed");
        backend
    }

    async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let give_up = Instant::now() + deadline;
        while Instant::now() < give_up {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[test]
    fn config_validation() {
        assert!(LeaderElectionConfig::default().validate().is_ok());

        let too_slow_lease = LeaderElectionConfig {
            lease_duration: Duration::from_millis(80),
            renew_interval: Duration::from_millis(50),
            retry_interval: Duration::from_millis(50),
        };
        let err = too_slow_lease.validate().expect_err("renew must be < lease/2");
        assert!(err.to_string().contains("renew_interval"));

        let zero_retry = LeaderElectionConfig {
            retry_interval: Duration::ZERO,
            ..LeaderElectionConfig::default()
        };
        assert!(zero_retry.validate().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_becomes_leader_and_steps_down() {
        let backend = open_backend().await;
        let election =
            LeaderElection::with_backend("cluster", fast_config(), backend.clone()).unwrap();

        let handle = election.spawn();
        assert!(
            wait_for(Duration::from_secs(2), || election.is_leader()).await,
            "node should become leader"
        );
        assert!(election.last_renewal().is_some());
        assert!(backend.locked("cluster").await.unwrap());

        handle.shutdown().await;
        assert!(!election.is_leader());
        // Shutdown released the lease instead of waiting for expiry.
        assert!(!backend.locked("cluster").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exactly_one_leader_with_failover() {
        let backend = open_backend().await;
        let first =
            LeaderElection::with_backend("cluster", fast_config(), backend.clone()).unwrap();
        let second =
            LeaderElection::with_backend("cluster", fast_config(), backend.clone()).unwrap();

        let first_handle = first.spawn();
        let second_handle = second.spawn();

        assert!(
            wait_for(Duration::from_secs(2), || first.is_leader() || second.is_leader()).await,
            "one node should become leader"
        );

        // Steady state: never both at once.
        for _ in 0..10 {
            assert!(
                !(first.is_leader() && second.is_leader()),
                "both nodes claim leadership"
            );
            sleep(Duration::from_millis(20)).await;
        }

        let (leader_handle, follower, follower_handle) = if first.is_leader() {
            (first_handle, &second, second_handle)
        } else {
            (second_handle, &first, first_handle)
        };

        leader_handle.shutdown().await;

        // The survivor takes over within retry_interval + lease.
        assert!(
            wait_for(Duration::from_millis(400), || follower.is_leader()).await,
            "survivor should take over leadership"
        );

        follower_handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backend_errors_are_retried() {
        let backend = open_backend().await;
        let election =
            LeaderElection::with_backend("cluster", fast_config(), backend.clone()).unwrap();

        // Close the backend under the running election: acquires now fail.
        let handle = election.spawn();
        assert!(wait_for(Duration::from_secs(2), || election.is_leader()).await);

        backend.close().await.unwrap();
        assert!(
            wait_for(Duration::from_secs(2), || !election.is_leader()).await,
            "leadership should drop while the backend is unavailable"
        );

        // Once the backend recovers the loop re-acquires on its own.
        backend.open().await.unwrap();
        assert!(
            wait_for(Duration::from_secs(2), || election.is_leader()).await,
            "leadership should recover with the backend"
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn missing_registry_backend_ends_run() {
        let _guard = crate::registry::test_guard();
        crate::registry::clear();

        let election = LeaderElection::new("cluster", fast_config()).unwrap();
        // Returns immediately instead of spinning without a backend.
        election.run(CancellationToken::new()).await;
        assert!(!election.is_leader());
    }
}
