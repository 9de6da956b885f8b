//! Flat-file store backend: JSON registry + sealed secrets file, both in the
//! deployment data directory.
//!
//! ## Race safety
//!
//! `register` and `update_heartbeat` are read-modify-write sequences that two
//! OS processes run near-simultaneously at startup. Each takes an exclusive
//! advisory flock on a sibling `.lock` file for the critical section, so
//! neither role's record can be dropped by an interleaved write. The payload
//! write itself is temp-file + fsync + rename, so a mid-write kill leaves
//! the previous registry intact.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{StateStore, StoreError, KEY_CHECK_TOKEN};
use crate::crypto::{self, CryptoError, SealingKeyMaterial};
use crate::fsutil;
use crate::process::ProcessManager;
use crate::types::{DaemonRecord, ExecutionMode, RegistryState, Role};

const REGISTRY_FILE: &str = "registry.json";
const SECRETS_FILE: &str = "secrets.json";
const LOCK_FILE: &str = "registry.lock";

#[derive(Debug, Serialize, Deserialize)]
struct SecretRecord {
    /// Hex-encoded sealed value.
    value: String,
    created_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsFile {
    /// Hex-encoded sealed [`KEY_CHECK_TOKEN`].
    check: String,
    #[serde(default)]
    entries: BTreeMap<String, SecretRecord>,
}

pub struct FileStore {
    registry_path: PathBuf,
    secrets_path: PathBuf,
    lock_path: PathBuf,
    key: SealingKeyMaterial,
    processes: Arc<dyn ProcessManager>,
}

impl FileStore {
    /// Open (or create) the store in `data_dir`.
    ///
    /// Fails with [`StoreError::BadKey`] when the directory already holds a
    /// secrets file sealed under a different key.
    pub fn open(
        data_dir: &Path,
        key: SealingKeyMaterial,
        processes: Arc<dyn ProcessManager>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let store = Self {
            registry_path: data_dir.join(REGISTRY_FILE),
            secrets_path: data_dir.join(SECRETS_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            key,
            processes,
        };
        store.verify_or_init_secrets()?;
        Ok(store)
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    fn verify_or_init_secrets(&self) -> Result<(), StoreError> {
        if !self.secrets_path.exists() {
            let sealed = crypto::seal(&self.key, KEY_CHECK_TOKEN)?;
            let fresh = SecretsFile {
                check: hex::encode(sealed),
                entries: BTreeMap::new(),
            };
            self.write_secrets(&fresh)?;
            return Ok(());
        }

        let secrets = self.read_secrets()?;
        let sealed = hex::decode(&secrets.check)
            .map_err(|e| StoreError::Unavailable(format!("corrupt key-check token: {e}")))?;
        match crypto::open(&self.key, &sealed) {
            Ok(token) if token == KEY_CHECK_TOKEN => Ok(()),
            Ok(_) | Err(CryptoError::Open) => Err(StoreError::BadKey),
            Err(e) => Err(e.into()),
        }
    }

    /// Hold an exclusive flock for the duration of a critical section.
    fn lock_exclusive(&self) -> Result<LockGuard, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockContention(e.to_string()))?;
        Ok(LockGuard { file })
    }

    fn read_registry(&self) -> Result<Option<RegistryState>, StoreError> {
        match fs::read(&self.registry_path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_registry(&self, state: &RegistryState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)?;
        fsutil::atomic_write(&self.registry_path, &bytes)?;
        fsutil::restrict_to_owner(&self.registry_path)?;
        Ok(())
    }

    fn read_secrets(&self) -> Result<SecretsFile, StoreError> {
        let bytes = fs::read(&self.secrets_path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_secrets(&self, secrets: &SecretsFile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(secrets)?;
        fsutil::atomic_write(&self.secrets_path, &bytes)?;
        fsutil::restrict_to_owner(&self.secrets_path)?;
        Ok(())
    }
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl StateStore for FileStore {
    fn register(
        &self,
        role: Role,
        pid: u32,
        process_name: &str,
        app_version: &str,
    ) -> Result<(), StoreError> {
        let _lock = self.lock_exclusive()?;

        let mut state = self.read_registry()?.unwrap_or_default();
        state.records.insert(
            role,
            DaemonRecord {
                role,
                pid,
                process_name: process_name.to_string(),
                last_heartbeat: Utc::now().timestamp(),
                app_version: app_version.to_string(),
            },
        );
        state.execution_mode = ExecutionMode::detect();
        if !app_version.is_empty() {
            state.app_version = app_version.to_string();
        }
        self.write_registry(&state)
    }

    fn partner(&self, role: Role) -> Result<DaemonRecord, StoreError> {
        let partner = role.partner();
        self.read_registry()?
            .and_then(|state| state.records.get(&partner).cloned())
            .ok_or(StoreError::NotRegistered(partner))
    }

    fn update_heartbeat(&self, role: Role) -> Result<(), StoreError> {
        let _lock = self.lock_exclusive()?;

        let mut state = self
            .read_registry()?
            .ok_or(StoreError::NotRegistered(role))?;
        let record = state
            .records
            .get_mut(&role)
            .ok_or(StoreError::NotRegistered(role))?;
        // Monotonic while the PID lives, even across clock adjustments.
        record.last_heartbeat = record.last_heartbeat.max(Utc::now().timestamp());
        self.write_registry(&state)
    }

    fn is_partner_alive(&self, role: Role) -> Result<bool, StoreError> {
        match self.partner(role) {
            Ok(partner) => Ok(self.processes.is_running(partner.pid)),
            Err(StoreError::NotRegistered(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_all(&self) -> Result<Option<RegistryState>, StoreError> {
        self.read_registry()
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _lock = self.lock_exclusive()?;
        match fs::remove_file(&self.registry_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_secret(&self, key: &str) -> Result<String, StoreError> {
        let secrets = self.read_secrets()?;
        let record = secrets
            .entries
            .get(key)
            .ok_or_else(|| StoreError::SecretNotFound(key.to_string()))?;
        let sealed = hex::decode(&record.value)
            .map_err(|e| StoreError::Unavailable(format!("corrupt secret {key:?}: {e}")))?;
        let plain = crypto::open(&self.key, &sealed)?;
        String::from_utf8(plain)
            .map_err(|_| StoreError::Unavailable(format!("secret {key:?} is not valid UTF-8")))
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _lock = self.lock_exclusive()?;

        let mut secrets = self.read_secrets()?;
        let sealed = crypto::seal(&self.key, value.as_bytes())?;
        secrets.entries.insert(
            key.to_string(),
            SecretRecord {
                value: hex::encode(sealed),
                created_at: Utc::now().timestamp(),
            },
        );
        self.write_secrets(&secrets)
    }

    fn all_secrets(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let secrets = self.read_secrets()?;
        let mut out = BTreeMap::new();
        for key in secrets.entries.keys() {
            out.insert(key.clone(), self.get_secret(key)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SignalError;

    /// Probe with a fixed answer, so liveness tests don't depend on real PIDs.
    struct FixedProbe(bool);

    impl ProcessManager for FixedProbe {
        fn is_running(&self, _pid: u32) -> bool {
            self.0
        }
        fn terminate(&self, _pid: u32) -> Result<(), SignalError> {
            Ok(())
        }
        fn kill(&self, _pid: u32) -> Result<(), SignalError> {
            Ok(())
        }
    }

    /// One key per test dir so reopening sees the same key.
    fn dir_key(dir: &Path) -> SealingKeyMaterial {
        crate::keys::KeyFile::in_dir(dir).ensure().unwrap()
    }

    fn open_store(dir: &Path, alive: bool) -> FileStore {
        FileStore::open(dir, dir_key(dir), Arc::new(FixedProbe(alive))).unwrap()
    }

    #[test]
    fn register_then_get_all_shows_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);

        store.register(Role::Patrol, 1234, "ident-a", "0.1.0").unwrap();

        let state = store.get_all().unwrap().unwrap();
        let rec = state.record(Role::Patrol).unwrap();
        assert_eq!(rec.pid, 1234);
        assert_eq!(rec.process_name, "ident-a");
        assert!(rec.last_heartbeat > 0);
        assert_eq!(state.app_version, "0.1.0");
    }

    #[test]
    fn register_preserves_the_other_roles_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);

        store.register(Role::Patrol, 100, "a", "0.1.0").unwrap();
        store.register(Role::Warden, 200, "b", "0.1.0").unwrap();

        let state = store.get_all().unwrap().unwrap();
        assert_eq!(state.record(Role::Patrol).unwrap().pid, 100);
        assert_eq!(state.record(Role::Warden).unwrap().pid, 200);
    }

    #[test]
    fn concurrent_registers_never_lose_a_record() {
        let dir = tempfile::tempdir().unwrap();
        // Seed the key file once so both "processes" share it.
        let _ = dir_key(dir.path());

        let path = dir.path().to_path_buf();
        let spawn_role = |role: Role, base_pid: u32| {
            let path = path.clone();
            std::thread::spawn(move || {
                let store =
                    FileStore::open(&path, dir_key(&path), Arc::new(FixedProbe(true))).unwrap();
                for i in 0..25 {
                    store
                        .register(role, base_pid + i, &format!("{role}-{i}"), "0.1.0")
                        .unwrap();
                }
            })
        };

        let a = spawn_role(Role::Patrol, 1000);
        let b = spawn_role(Role::Warden, 2000);
        a.join().unwrap();
        b.join().unwrap();

        let store = open_store(dir.path(), true);
        let state = store.get_all().unwrap().unwrap();
        assert_eq!(state.record(Role::Patrol).unwrap().pid, 1024);
        assert_eq!(state.record(Role::Warden).unwrap().pid, 2024);
    }

    #[test]
    fn partner_of_unregistered_role_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);
        store.register(Role::Patrol, 1, "a", "0.1.0").unwrap();

        // Patrol's partner (warden) is missing.
        assert!(matches!(
            store.partner(Role::Patrol),
            Err(StoreError::NotRegistered(Role::Warden))
        ));
        // Warden's partner (patrol) exists.
        assert_eq!(store.partner(Role::Warden).unwrap().pid, 1);
    }

    #[test]
    fn absent_partner_is_not_alive_and_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);
        assert!(!store.is_partner_alive(Role::Patrol).unwrap());
    }

    #[test]
    fn partner_liveness_follows_the_probe() {
        let dir = tempfile::tempdir().unwrap();

        let store = open_store(dir.path(), true);
        store.register(Role::Warden, 77, "w", "0.1.0").unwrap();
        assert!(store.is_partner_alive(Role::Patrol).unwrap());

        let dead = open_store(dir.path(), false);
        assert!(!dead.is_partner_alive(Role::Patrol).unwrap());
    }

    #[test]
    fn heartbeat_requires_registration_and_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);

        assert!(matches!(
            store.update_heartbeat(Role::Patrol),
            Err(StoreError::NotRegistered(Role::Patrol))
        ));

        store.register(Role::Patrol, 1, "a", "0.1.0").unwrap();
        let before = store.get_all().unwrap().unwrap();
        let hb0 = before.record(Role::Patrol).unwrap().last_heartbeat;

        store.update_heartbeat(Role::Patrol).unwrap();
        let after = store.get_all().unwrap().unwrap();
        assert!(after.record(Role::Patrol).unwrap().last_heartbeat >= hb0);
    }

    #[test]
    fn clear_drops_records_but_keeps_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);

        store.register(Role::Patrol, 1, "a", "0.1.0").unwrap();
        store.set_secret("service_label", "com.vendor.svc.a1b2").unwrap();

        store.clear().unwrap();
        assert!(store.get_all().unwrap().is_none());
        assert_eq!(
            store.get_secret("service_label").unwrap(),
            "com.vendor.svc.a1b2"
        );
    }

    #[test]
    fn secrets_roundtrip_and_enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);

        store.set_secret("alpha", "1").unwrap();
        store.set_secret("beta", "2").unwrap();
        store.set_secret("alpha", "3").unwrap(); // overwrite

        let all = store.all_secrets().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["alpha"], "3");
        assert_eq!(all["beta"], "2");

        assert!(matches!(
            store.get_secret("gamma"),
            Err(StoreError::SecretNotFound(_))
        ));
    }

    #[test]
    fn secrets_are_not_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);
        store.set_secret("k", "super-sensitive-value").unwrap();

        let raw = fs::read_to_string(dir.path().join(SECRETS_FILE)).unwrap();
        assert!(!raw.contains("super-sensitive-value"));
    }

    #[test]
    fn opening_with_wrong_key_fails_outright() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), true);
        store.set_secret("k", "v").unwrap();
        drop(store);

        let wrong = SealingKeyMaterial::generate().unwrap();
        let result = FileStore::open(dir.path(), wrong, Arc::new(FixedProbe(true)));
        assert!(matches!(result, Err(StoreError::BadKey)));
    }
}
