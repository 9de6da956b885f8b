//! Shared persistent state: role registration, heartbeats, and secrets.
//!
//! The store is the one piece of state genuinely shared by the two role
//! processes, so every read-modify-write sequence must be serialized across
//! OS processes. Two interchangeable backends implement the same trait:
//!
//! - [`FileStore`]: JSON registry guarded by an advisory flock, with all
//!   writes going through atomic replacement.
//! - [`SqliteStore`]: a transactional single-writer SQLite database.
//!
//! Secrets are an independent namespace: they survive [`StateStore::clear`]
//! and are sealed at rest, and opening a store with the wrong key fails
//! outright instead of yielding garbage.

mod file;
mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use crate::crypto::CryptoError;
use crate::types::{DaemonRecord, RegistryState, Role};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("role {0} not registered")]
    NotRegistered(Role),
    #[error("secret {0:?} not found")]
    SecretNotFound(String),
    #[error("store key rejected")]
    BadKey,
    #[error("store lock contention: {0}")]
    LockContention(String),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store database: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Persistent record of both roles' identity/liveness plus a secrets
/// namespace. Implementations must make `register` and `update_heartbeat`
/// atomic under concurrent calls from two OS processes.
pub trait StateStore: Send + Sync {
    /// Upsert this role's record wholesale and refresh the deployment
    /// metadata (execution mode, app version). Sets `last_heartbeat` to now.
    fn register(
        &self,
        role: Role,
        pid: u32,
        process_name: &str,
        app_version: &str,
    ) -> Result<(), StoreError>;

    /// The other role's record; `NotRegistered` if it has none.
    fn partner(&self, role: Role) -> Result<DaemonRecord, StoreError>;

    /// Bump this role's heartbeat; `NotRegistered` if the role itself was
    /// never registered.
    fn update_heartbeat(&self, role: Role) -> Result<(), StoreError>;

    /// OS-level liveness of the partner's recorded PID. An unregistered
    /// partner is simply not alive: `Ok(false)`, not an error.
    fn is_partner_alive(&self, role: Role) -> Result<bool, StoreError>;

    /// Full registry state, or `None` when nothing has ever registered.
    fn get_all(&self) -> Result<Option<RegistryState>, StoreError>;

    /// Drop all daemon records and deployment metadata. Secrets survive.
    fn clear(&self) -> Result<(), StoreError>;

    fn get_secret(&self, key: &str) -> Result<String, StoreError>;

    fn set_secret(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn all_secrets(&self) -> Result<BTreeMap<String, String>, StoreError>;
}

/// Sentinel sealed into every store at creation; decrypting it at open time
/// is how a wrong key is detected before any data is served.
pub(crate) const KEY_CHECK_TOKEN: &[u8] = b"vigil.store.key-check.v1";
