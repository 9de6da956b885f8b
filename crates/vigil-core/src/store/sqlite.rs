//! SQLite store backend: a transactional single-writer database.
//!
//! Cross-process serialization comes from SQLite itself: `register` runs in
//! one transaction, and `busy_timeout` turns writer contention into a short
//! wait instead of an error. Secret values are sealed with the store key
//! before they touch the database, and a `meta('key_check')` row written at
//! creation rejects wrong keys at open time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{StateStore, StoreError, KEY_CHECK_TOKEN};
use crate::crypto::{self, CryptoError, SealingKeyMaterial};
use crate::process::ProcessManager;
use crate::types::{DaemonRecord, ExecutionMode, RegistryState, Role};

const DB_FILE: &str = "registry.db";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    key: SealingKeyMaterial,
    processes: Arc<dyn ProcessManager>,
}

impl SqliteStore {
    /// Open (or create) the database under `data_dir`.
    ///
    /// Fails with [`StoreError::BadKey`] when the database was created under
    /// a different key.
    pub fn open(
        data_dir: &Path,
        key: SealingKeyMaterial,
        processes: Arc<dyn ProcessManager>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS daemon_state (
                 role           TEXT PRIMARY KEY,
                 pid            INTEGER NOT NULL,
                 process_name   TEXT NOT NULL,
                 last_heartbeat INTEGER NOT NULL,
                 app_version    TEXT NOT NULL DEFAULT ''
             );

             CREATE TABLE IF NOT EXISTS secrets (
                 key        TEXT PRIMARY KEY,
                 value      BLOB NOT NULL,
                 created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
            key,
            processes,
        };
        store.verify_or_init_key_check()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn verify_or_init_key_check(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        let existing: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'key_check'", [], |r| {
                r.get(0)
            })
            .optional()?;

        match existing {
            None => {
                let sealed = crypto::seal(&self.key, KEY_CHECK_TOKEN)?;
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('key_check', ?1)",
                    params![hex::encode(sealed)],
                )?;
                Ok(())
            }
            Some(encoded) => {
                let sealed = hex::decode(&encoded)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt key-check row: {e}")))?;
                match crypto::open(&self.key, &sealed) {
                    Ok(token) if token == KEY_CHECK_TOKEN => Ok(()),
                    Ok(_) | Err(CryptoError::Open) => Err(StoreError::BadKey),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))
    }

    fn role_record(conn: &Connection, role: Role) -> Result<Option<DaemonRecord>, StoreError> {
        let record = conn
            .query_row(
                "SELECT pid, process_name, last_heartbeat, app_version
                 FROM daemon_state WHERE role = ?1",
                params![role.as_str()],
                |row| {
                    Ok(DaemonRecord {
                        role,
                        pid: row.get::<_, i64>(0)? as u32,
                        process_name: row.get(1)?,
                        last_heartbeat: row.get(2)?,
                        app_version: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl StateStore for SqliteStore {
    fn register(
        &self,
        role: Role,
        pid: u32,
        process_name: &str,
        app_version: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO daemon_state
                 (role, pid, process_name, last_heartbeat, app_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                role.as_str(),
                pid as i64,
                process_name,
                Utc::now().timestamp(),
                app_version
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('mode', ?1)",
            params![ExecutionMode::detect().as_str()],
        )?;
        if !app_version.is_empty() {
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('app_version', ?1)",
                params![app_version],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn partner(&self, role: Role) -> Result<DaemonRecord, StoreError> {
        let partner = role.partner();
        let conn = self.lock_conn()?;
        Self::role_record(&conn, partner)?.ok_or(StoreError::NotRegistered(partner))
    }

    fn update_heartbeat(&self, role: Role) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE daemon_state
             SET last_heartbeat = MAX(last_heartbeat, ?1)
             WHERE role = ?2",
            params![Utc::now().timestamp(), role.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotRegistered(role));
        }
        Ok(())
    }

    fn is_partner_alive(&self, role: Role) -> Result<bool, StoreError> {
        match self.partner(role) {
            Ok(partner) => Ok(self.processes.is_running(partner.pid)),
            Err(StoreError::NotRegistered(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_all(&self) -> Result<Option<RegistryState>, StoreError> {
        let conn = self.lock_conn()?;
        let mut state = RegistryState::default();

        for role in [Role::Patrol, Role::Warden] {
            if let Some(record) = Self::role_record(&conn, role)? {
                state.records.insert(role, record);
            }
        }
        if state.records.is_empty() {
            return Ok(None);
        }

        let meta = |key: &str| -> Result<Option<String>, rusqlite::Error> {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
        };
        if let Some(mode) = meta("mode")? {
            if mode == "system" {
                state.execution_mode = ExecutionMode::System;
            }
        }
        if let Some(version) = meta("app_version")? {
            state.app_version = version;
        }
        Ok(Some(state))
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM daemon_state", [])?;
        tx.execute(
            "DELETE FROM meta WHERE key IN ('mode', 'app_version')",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Result<String, StoreError> {
        let conn = self.lock_conn()?;
        let sealed: Vec<u8> = conn
            .query_row(
                "SELECT value FROM secrets WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::SecretNotFound(key.to_string()))?;
        let plain = crypto::open(&self.key, &sealed)?;
        String::from_utf8(plain)
            .map_err(|_| StoreError::Unavailable(format!("secret {key:?} is not valid UTF-8")))
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let sealed = crypto::seal(&self.key, value.as_bytes())?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO secrets (key, value, created_at) VALUES (?1, ?2, ?3)",
            params![key, sealed, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn all_secrets(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let keys: Vec<String> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare("SELECT key FROM secrets ORDER BY key")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut out = BTreeMap::new();
        for key in keys {
            let value = self.get_secret(&key)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}
