use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncError;

/// Storage contract for named, expiring, token-fenced locks.
///
/// A backend manages one record per `name`: the `token` of the current
/// holder and an absolute expiry deadline. An expired record is
/// indistinguishable from an absent one. Implementations must keep each
/// mutation atomic with respect to concurrent callers of the same name: a
/// concurrent acquire either observes the live holder or replaces an
/// expired/absent record, never both.
///
/// Backends signal storage unavailability as an error; they never return
/// `false` to disguise one. Every operation before [`open`](Self::open) or
/// after [`close`](Self::close) fails with [`SyncError::OutOfContext`].
#[async_trait]
pub trait SyncBackend: Send + Sync + std::fmt::Debug {
    /// Initialize the backend's connection resource (pool, table, map).
    async fn open(&self) -> Result<(), SyncError>;

    /// Tear down the backend's connection resource.
    ///
    /// Guaranteed-safe to call on every exit path; idempotent.
    async fn close(&self) -> Result<(), SyncError>;

    /// Attempt to claim `name` for `token` until now + `duration`.
    ///
    /// Succeeds when the record is absent, expired, or already held by the
    /// same `token` (reentrant extension refreshes the deadline). A live
    /// record under a different token refuses without mutating.
    async fn acquire(
        &self,
        name: &str,
        token: &str,
        duration: Duration,
    ) -> Result<bool, SyncError>;

    /// Delete the record iff it is live and held by `token`.
    ///
    /// Returns `false` when the record is absent, expired, or held by a
    /// different token.
    async fn release(&self, name: &str, token: &str) -> Result<bool, SyncError>;

    /// Whether a live record exists for `name`.
    async fn locked(&self, name: &str) -> Result<bool, SyncError>;

    /// Whether a live record exists for `name` held by `token`.
    async fn owned(&self, name: &str, token: &str) -> Result<bool, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify object safety of the contract.
    fn _assert_dyn_sync_backend(_: &dyn SyncBackend) {}
}
