//! Distributed synchronization primitives for cooperating processes.
//!
//! The crate defines the [`SyncBackend`] storage contract for named,
//! expiring, token-fenced locks, ships the in-process reference
//! implementation ([`MemorySyncBackend`]), and builds the user-facing
//! primitives on top: [`Lock`] for scoped mutual exclusion and
//! [`LeaderElection`] for continuous leadership leases. Remote backends live
//! in their own crates (`palisade-sync-redis`, `palisade-sync-postgres`) and
//! plug in through the same contract, usually via the process-wide
//! [`registry`].

pub mod backend;
pub mod error;
pub mod leader;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod testing;

pub use backend::SyncBackend;
pub use error::SyncError;
pub use leader::{LeaderElection, LeaderElectionConfig, LeaderElectionHandle};
pub use lock::{Lock, LockFromThread, LockGuard};
pub use memory::MemorySyncBackend;
pub use registry::{BackendCategory, get_lock_backend, register_lock_backend};
