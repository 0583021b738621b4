//! Redis lock backend.
//!
//! Implements the `palisade-sync` backend contract with one Redis key per
//! lock and atomic server-side scripts for every mutation. See
//! [`RedisSyncBackend`] for the consistency guarantees.

pub mod backend;
pub mod scripts;
pub mod settings;

pub use backend::RedisSyncBackend;
pub use settings::RedisSettings;
