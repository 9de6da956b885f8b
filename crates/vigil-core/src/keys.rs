//! Key file management for the secrets namespace.
//!
//! The 32-byte sealing key lives in a 0600 file inside the deployment data
//! directory. It is generated once on first run and then reused, so values
//! sealed under it stay recoverable across restarts and reinstalls.

use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::{CryptoError, SealingKeyMaterial, KEY_LEN};
use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file holds {0} bytes, expected {KEY_LEN}")]
    BadLength(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// File-backed provider of the deployment's sealing key.
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location inside a data directory.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(".key"))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<SealingKeyMaterial, KeyError> {
        let bytes = fs::read(&self.path)?;
        if bytes.len() != KEY_LEN {
            return Err(KeyError::BadLength(bytes.len()));
        }
        Ok(SealingKeyMaterial::from_bytes(&bytes)?)
    }

    pub fn store(&self, key: &SealingKeyMaterial) -> Result<(), KeyError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fsutil::atomic_write(&self.path, key.as_bytes())?;
        fsutil::restrict_to_owner(&self.path)?;
        Ok(())
    }

    /// Load the key, generating and persisting a fresh one if none exists.
    pub fn ensure(&self) -> Result<SealingKeyMaterial, KeyError> {
        if self.exists() {
            return self.load();
        }
        let key = SealingKeyMaterial::generate()?;
        self.store(&key)?;
        Ok(key)
    }
}
