//! Lock-backend conformance suite.
//!
//! Call [`run_lock_backend_conformance`] from a backend's test module with a
//! freshly opened instance. The suite uses real sleeps for expiry cases, so
//! run it on a multi-threaded, non-paused runtime.

use std::time::Duration;

use tokio::time::sleep;
use uuid::Uuid;

use crate::backend::SyncBackend;
use crate::error::SyncError;

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

fn token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Run the full conformance suite against `backend`.
///
/// # Errors
///
/// Propagates backend failures; property violations panic with a
/// description of the broken expectation.
pub async fn run_lock_backend_conformance(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    acquire_grants_ownership(backend).await?;
    acquire_is_reentrant(backend).await?;
    acquire_is_mutually_exclusive(backend).await?;
    acquire_after_expiry(backend).await?;
    release_is_idempotent(backend).await?;
    release_checks_ownership(backend).await?;
    single_holder_round_trip(backend).await?;
    expiry_handover(backend).await?;
    Ok(())
}

async fn acquire_grants_ownership(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("acquire");
    let token = token();

    assert!(
        backend.acquire(&name, &token, Duration::from_secs(1)).await?,
        "acquire on a vacant name should succeed"
    );
    assert!(
        backend.owned(&name, &token).await?,
        "holder should observe ownership after acquire"
    );
    assert!(
        backend.locked(&name).await?,
        "anyone should observe the lock as held after acquire"
    );
    Ok(())
}

async fn acquire_is_reentrant(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("reentrant");
    let token = token();

    assert!(backend.acquire(&name, &token, Duration::from_secs(1)).await?);
    assert!(
        backend.acquire(&name, &token, Duration::from_secs(1)).await?,
        "same-token acquire should extend, not refuse"
    );
    Ok(())
}

async fn acquire_is_mutually_exclusive(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("exclusive");
    let first = token();
    let second = token();

    assert!(backend.acquire(&name, &first, Duration::from_secs(1)).await?);
    assert!(
        !backend.acquire(&name, &second, Duration::from_secs(1)).await?,
        "foreign-token acquire against a live record should refuse"
    );
    assert!(
        backend.owned(&name, &first).await?,
        "refused acquire must not mutate the record"
    );
    Ok(())
}

async fn acquire_after_expiry(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("expiry");
    let first = token();
    let second = token();

    assert!(backend.acquire(&name, &first, Duration::from_millis(50)).await?);
    sleep(Duration::from_millis(150)).await;

    assert!(
        !backend.locked(&name).await?,
        "expired record should read as vacant"
    );
    assert!(
        backend.acquire(&name, &second, Duration::from_secs(1)).await?,
        "foreign token should acquire once the record expired"
    );
    Ok(())
}

async fn release_is_idempotent(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("idempotent");
    let token = token();

    assert!(backend.acquire(&name, &token, Duration::from_secs(1)).await?);
    assert!(
        backend.release(&name, &token).await?,
        "first release of a held lock should succeed"
    );
    assert!(
        !backend.release(&name, &token).await?,
        "second release of the same token should refuse"
    );
    Ok(())
}

async fn release_checks_ownership(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("ownership");
    let holder = token();
    let stranger = token();

    assert!(backend.acquire(&name, &holder, Duration::from_secs(1)).await?);
    assert!(
        !backend.release(&name, &stranger).await?,
        "foreign-token release should refuse"
    );
    assert!(
        backend.owned(&name, &holder).await?,
        "refused release must not mutate the record"
    );
    Ok(())
}

async fn single_holder_round_trip(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("round-trip");

    assert!(backend.acquire(&name, "A", Duration::from_secs(1)).await?);
    assert!(!backend.acquire(&name, "B", Duration::from_secs(1)).await?);
    assert!(!backend.release(&name, "B").await?);
    assert!(backend.release(&name, "A").await?);
    assert!(!backend.locked(&name).await?);
    Ok(())
}

async fn expiry_handover(backend: &dyn SyncBackend) -> Result<(), SyncError> {
    let name = unique("handover");

    assert!(backend.acquire(&name, "A", Duration::from_millis(50)).await?);
    sleep(Duration::from_millis(100)).await;
    assert!(backend.acquire(&name, "B", Duration::from_secs(1)).await?);
    assert!(!backend.owned(&name, "A").await?);
    assert!(backend.owned(&name, "B").await?);
    Ok(())
}
