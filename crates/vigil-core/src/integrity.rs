//! Binary integrity guardian: fingerprint the installed executable, keep
//! redundant copies alive, and put the binary back when it goes missing or
//! stops matching its fingerprint.
//!
//! The one genuinely subtle decision lives in `verify_and_restore`: a hash
//! mismatch is either corruption or a legitimate external upgrade, and the
//! only witness is the installed binary's own version report. The policy is
//! conservative: if the binary cannot be queried, or does not report a
//! strictly newer version, it is treated as corrupt and restored.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::{download_to_temp, ArtifactSource};
use crate::fsutil;
use crate::types::ExecutionMode;
use crate::version::{is_newer_version, VersionProbe};

/// Name of the copy placed inside each backup directory.
const BACKUP_FILE: &str = ".vigil.bak";

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("no backup manifest at {0}")]
    NoManifest(PathBuf),
    #[error("all {attempted} backup locations failed")]
    BackupFailed { attempted: usize },
    #[error("restore exhausted; local: {local}; remote: {remote}")]
    RestoreExhausted { local: String, remote: String },
    #[error("integrity I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persisted record of the binary the system considers "good".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub main_binary_path: PathBuf,
    pub sha256: String,
    pub backup_paths: Vec<PathBuf>,
    pub service_unit_path: PathBuf,
    pub version: String,
    pub build_time: String,
    pub execution_mode: ExecutionMode,
}

/// Where a restore sourced its binary from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    LocalBackup(PathBuf),
    Artifact,
}

/// Outcome of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Hash matches the manifest; nothing touched.
    Intact,
    /// Hash differs but the binary self-reports a strictly newer version;
    /// the manifest was refreshed and the binary left alone.
    LegitimateUpdate { version: String },
    /// The binary was missing or corrupt and has been restored.
    Restored { source: RestoreSource },
}

impl Verification {
    pub fn restored(&self) -> bool {
        matches!(self, Verification::Restored { .. })
    }
}

pub struct IntegrityGuardian {
    manifest_path: PathBuf,
    backup_dirs: Vec<PathBuf>,
    service_unit_path: PathBuf,
    artifact: Arc<dyn ArtifactSource>,
    probe: Arc<dyn VersionProbe>,
}

impl IntegrityGuardian {
    pub fn new(
        manifest_path: impl Into<PathBuf>,
        backup_dirs: Vec<PathBuf>,
        service_unit_path: impl Into<PathBuf>,
        artifact: Arc<dyn ArtifactSource>,
        probe: Arc<dyn VersionProbe>,
    ) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            backup_dirs,
            service_unit_path: service_unit_path.into(),
            artifact,
            probe,
        }
    }

    /// Copy the binary at `main_binary` to every configured backup location
    /// and persist a fresh manifest.
    ///
    /// Partial success across locations is fine; the copies exist for
    /// directory diversity, not quorum. Total failure is an error.
    pub fn setup_backups(
        &self,
        main_binary: &Path,
        version: &str,
        build_time: &str,
    ) -> Result<BackupManifest, IntegrityError> {
        let sha256 = fsutil::sha256_file(main_binary)?;

        let mut placed = Vec::new();
        for dir in &self.backup_dirs {
            match self.place_backup(dir, main_binary) {
                Ok(path) => placed.push(path),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "backup location failed");
                }
            }
        }
        if placed.is_empty() {
            return Err(IntegrityError::BackupFailed {
                attempted: self.backup_dirs.len(),
            });
        }

        let manifest = BackupManifest {
            main_binary_path: main_binary.to_path_buf(),
            sha256,
            backup_paths: placed,
            service_unit_path: self.service_unit_path.clone(),
            version: version.to_string(),
            build_time: build_time.to_string(),
            execution_mode: ExecutionMode::detect(),
        };
        self.save_manifest(&manifest)?;
        info!(
            copies = manifest.backup_paths.len(),
            version = %manifest.version,
            "backups refreshed"
        );
        Ok(manifest)
    }

    fn place_backup(&self, dir: &Path, main_binary: &Path) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
        let dest = dir.join(BACKUP_FILE);
        fsutil::atomic_copy(main_binary, &dest)?;
        fsutil::mark_executable(&dest)?;
        Ok(dest)
    }

    pub fn manifest(&self) -> Result<BackupManifest, IntegrityError> {
        match fs::read(&self.manifest_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IntegrityError::NoManifest(self.manifest_path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save_manifest(&self, manifest: &BackupManifest) -> Result<(), IntegrityError> {
        if let Some(parent) = self.manifest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(manifest)?;
        fsutil::atomic_write(&self.manifest_path, &bytes)?;
        fsutil::restrict_to_owner(&self.manifest_path)?;
        Ok(())
    }

    /// The installed binary path the manifest tracks, if a manifest exists.
    pub fn main_binary_path(&self) -> Option<PathBuf> {
        self.manifest().ok().map(|m| m.main_binary_path)
    }

    /// Verify the installed binary against the manifest and restore it if
    /// missing or corrupted. See the module docs for the disambiguation
    /// policy on hash mismatches.
    pub async fn verify_and_restore(&self) -> Result<Verification, IntegrityError> {
        let manifest = self.manifest()?;
        let main = &manifest.main_binary_path;

        if !main.exists() {
            warn!(binary = %main.display(), "installed binary missing");
            return self.restore_with_fallback(&manifest).await;
        }

        let current = match fsutil::sha256_file(main) {
            Ok(sha) => sha,
            Err(e) => {
                warn!(error = %e, "could not fingerprint installed binary");
                return self.restore_with_fallback(&manifest).await;
            }
        };
        if current == manifest.sha256 {
            return Ok(Verification::Intact);
        }

        // Hash mismatch. Ask the binary itself what version it is.
        match self.probe.query(main) {
            Ok(reported) if is_newer_version(&reported, &manifest.version) => {
                info!(
                    from = %manifest.version,
                    to = %reported,
                    "external upgrade detected, refreshing manifest"
                );
                self.setup_backups(main, &reported, "")?;
                Ok(Verification::LegitimateUpdate { version: reported })
            }
            Ok(reported) => {
                warn!(
                    reported = %reported,
                    recorded = %manifest.version,
                    "hash mismatch without a newer version, treating as corruption"
                );
                self.restore_with_fallback(&manifest).await
            }
            Err(e) => {
                // Unqueryable binary: favor restoring over trusting it.
                warn!(error = %e, "version query failed, treating as corruption");
                self.restore_with_fallback(&manifest).await
            }
        }
    }

    async fn restore_with_fallback(
        &self,
        manifest: &BackupManifest,
    ) -> Result<Verification, IntegrityError> {
        let local_err = match self.restore_from_local(manifest) {
            Ok(source) => {
                info!("binary restored from local backup");
                return Ok(Verification::Restored { source });
            }
            Err(e) => e,
        };
        warn!(error = %local_err, "local restore failed, falling back to artifact source");

        match self.restore_from_artifact(manifest).await {
            Ok(()) => Ok(Verification::Restored {
                source: RestoreSource::Artifact,
            }),
            Err(remote_err) => Err(IntegrityError::RestoreExhausted {
                local: local_err,
                remote: remote_err.to_string(),
            }),
        }
    }

    /// Try each backup in turn; only a copy whose hash still matches the
    /// manifest is trusted as a restore source.
    fn restore_from_local(&self, manifest: &BackupManifest) -> Result<RestoreSource, String> {
        for backup in &manifest.backup_paths {
            match fsutil::sha256_file(backup) {
                Ok(sha) if sha == manifest.sha256 => {
                    if let Some(parent) = manifest.main_binary_path.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    match fsutil::atomic_copy(backup, &manifest.main_binary_path) {
                        Ok(()) => {
                            let _ = fsutil::mark_executable(&manifest.main_binary_path);
                            return Ok(RestoreSource::LocalBackup(backup.clone()));
                        }
                        Err(e) => {
                            warn!(backup = %backup.display(), error = %e, "restore copy failed");
                        }
                    }
                }
                Ok(_) => {
                    warn!(backup = %backup.display(), "backup hash mismatch, skipping");
                }
                Err(e) => {
                    warn!(backup = %backup.display(), error = %e, "backup unreadable, skipping");
                }
            }
        }
        Err("all local backups missing or hash-mismatched".into())
    }

    async fn restore_from_artifact(&self, manifest: &BackupManifest) -> Result<(), IntegrityError> {
        let fetched = download_to_temp(self.artifact.as_ref())
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let result = (|| -> Result<(), IntegrityError> {
            if let Some(parent) = manifest.main_binary_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fsutil::atomic_copy(&fetched, &manifest.main_binary_path)?;
            fsutil::mark_executable(&manifest.main_binary_path)?;
            Ok(())
        })();
        if let Some(dir) = fetched.parent() {
            let _ = fs::remove_dir_all(dir);
        }
        result?;

        info!("binary restored from artifact source");

        // Refresh local copies from the freshly fetched binary. The restore
        // itself already succeeded, so a refresh failure only warns.
        let version = self
            .artifact
            .get_latest_version()
            .await
            .unwrap_or_else(|_| manifest.version.clone());
        if let Err(e) = self.setup_backups(&manifest.main_binary_path, &version, "") {
            warn!(error = %e, "failed to refresh backups after artifact restore");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactError;
    use crate::version::VersionError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubProbe(Mutex<Result<String, String>>);

    impl StubProbe {
        fn reporting(version: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Ok(version.to_string()))))
        }
        fn failing() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Err("no such binary".into()))))
        }
    }

    impl VersionProbe for StubProbe {
        fn query(&self, binary: &Path) -> Result<String, VersionError> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| VersionError::Query {
                    binary: binary.display().to_string(),
                    reason,
                })
        }
    }

    struct StubArtifact {
        version: String,
        payload: Option<Vec<u8>>,
    }

    impl StubArtifact {
        fn serving(version: &str, payload: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                version: version.to_string(),
                payload: Some(payload.to_vec()),
            })
        }
        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                version: String::new(),
                payload: None,
            })
        }
    }

    #[async_trait]
    impl ArtifactSource for StubArtifact {
        async fn get_latest_version(&self) -> Result<String, ArtifactError> {
            if self.payload.is_some() {
                Ok(self.version.clone())
            } else {
                Err(ArtifactError::Request("unreachable".into()))
            }
        }

        async fn download_latest(&self, dest: &Path) -> Result<(), ArtifactError> {
            match &self.payload {
                Some(bytes) => {
                    fsutil::atomic_write(dest, bytes)?;
                    Ok(())
                }
                None => Err(ArtifactError::Request("unreachable".into())),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        guardian: IntegrityGuardian,
        binary: PathBuf,
    }

    fn fixture(artifact: Arc<dyn ArtifactSource>, probe: Arc<dyn VersionProbe>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("bin").join("vigil");
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, b"original binary v1").unwrap();

        let guardian = IntegrityGuardian::new(
            dir.path().join("manifest.json"),
            vec![dir.path().join("bk1"), dir.path().join("bk2")],
            dir.path().join("service.plist"),
            artifact,
            probe,
        );
        Fixture {
            _dir: dir,
            guardian,
            binary,
        }
    }

    #[test]
    fn setup_places_copies_and_saves_manifest() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::failing());
        let manifest = fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        assert_eq!(manifest.backup_paths.len(), 2);
        for path in &manifest.backup_paths {
            assert_eq!(fs::read(path).unwrap(), b"original binary v1");
        }
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.sha256, fsutil::sha256_file(&fx.binary).unwrap());
        assert_eq!(fx.guardian.manifest().unwrap().sha256, manifest.sha256);
    }

    #[test]
    fn setup_tolerates_partial_location_failure() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("vigil");
        fs::write(&binary, b"payload").unwrap();

        // A path routed through a regular file cannot become a directory.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let guardian = IntegrityGuardian::new(
            dir.path().join("manifest.json"),
            vec![blocker.join("sub"), dir.path().join("ok")],
            dir.path().join("unit"),
            StubArtifact::unreachable(),
            StubProbe::failing(),
        );
        let manifest = guardian.setup_backups(&binary, "1.0.0", "").unwrap();
        assert_eq!(manifest.backup_paths.len(), 1);
    }

    #[test]
    fn setup_fails_when_every_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("vigil");
        fs::write(&binary, b"payload").unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let guardian = IntegrityGuardian::new(
            dir.path().join("manifest.json"),
            vec![blocker.join("a"), blocker.join("b")],
            dir.path().join("unit"),
            StubArtifact::unreachable(),
            StubProbe::failing(),
        );
        assert!(matches!(
            guardian.setup_backups(&binary, "1.0.0", ""),
            Err(IntegrityError::BackupFailed { attempted: 2 })
        ));
    }

    #[tokio::test]
    async fn intact_binary_is_left_alone() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::failing());
        fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        let outcome = fx.guardian.verify_and_restore().await.unwrap();
        assert_eq!(outcome, Verification::Intact);
        assert_eq!(fs::read(&fx.binary).unwrap(), b"original binary v1");
    }

    #[tokio::test]
    async fn missing_binary_is_restored_from_local_backup() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::failing());
        let manifest = fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        fs::remove_file(&fx.binary).unwrap();
        let outcome = fx.guardian.verify_and_restore().await.unwrap();

        assert!(outcome.restored());
        assert_eq!(
            fsutil::sha256_file(&fx.binary).unwrap(),
            manifest.sha256,
            "restored file must match the manifest fingerprint"
        );
    }

    #[tokio::test]
    async fn unqueryable_mismatch_is_treated_as_corruption() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::failing());
        fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        fs::write(&fx.binary, b"tampered").unwrap();
        let outcome = fx.guardian.verify_and_restore().await.unwrap();

        assert!(outcome.restored());
        assert_eq!(fs::read(&fx.binary).unwrap(), b"original binary v1");
    }

    #[tokio::test]
    async fn stale_version_report_is_treated_as_corruption() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::reporting("1.0.0"));
        fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        fs::write(&fx.binary, b"same version, different bytes").unwrap();
        let outcome = fx.guardian.verify_and_restore().await.unwrap();

        assert!(outcome.restored());
        assert_eq!(fs::read(&fx.binary).unwrap(), b"original binary v1");
    }

    #[tokio::test]
    async fn newer_version_refreshes_manifest_without_restore() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::reporting("2.0.0"));
        fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        fs::write(&fx.binary, b"upgraded binary v2").unwrap();
        let outcome = fx.guardian.verify_and_restore().await.unwrap();

        assert_eq!(
            outcome,
            Verification::LegitimateUpdate {
                version: "2.0.0".into()
            }
        );
        // Binary untouched, manifest re-pointed at the new build.
        assert_eq!(fs::read(&fx.binary).unwrap(), b"upgraded binary v2");
        let manifest = fx.guardian.manifest().unwrap();
        assert_eq!(manifest.version, "2.0.0");
        assert_eq!(manifest.sha256, fsutil::sha256_file(&fx.binary).unwrap());
    }

    #[tokio::test]
    async fn corrupt_backups_fall_back_to_the_artifact_source() {
        let fx = fixture(
            StubArtifact::serving("1.1.0", b"fetched binary v1.1"),
            StubProbe::failing(),
        );
        let manifest = fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        fs::remove_file(&fx.binary).unwrap();
        for backup in &manifest.backup_paths {
            fs::write(backup, b"rotted").unwrap();
        }

        let outcome = fx.guardian.verify_and_restore().await.unwrap();
        assert_eq!(
            outcome,
            Verification::Restored {
                source: RestoreSource::Artifact
            }
        );
        assert_eq!(fs::read(&fx.binary).unwrap(), b"fetched binary v1.1");

        // Local copies and manifest were refreshed from the fetched binary.
        let refreshed = fx.guardian.manifest().unwrap();
        assert_eq!(refreshed.version, "1.1.0");
        assert_eq!(refreshed.sha256, fsutil::sha256_file(&fx.binary).unwrap());
        for backup in &refreshed.backup_paths {
            assert_eq!(fs::read(backup).unwrap(), b"fetched binary v1.1");
        }
    }

    #[tokio::test]
    async fn both_restore_paths_failing_is_exhaustion() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::failing());
        let manifest = fx.guardian.setup_backups(&fx.binary, "1.0.0", "").unwrap();

        fs::remove_file(&fx.binary).unwrap();
        for backup in &manifest.backup_paths {
            fs::remove_file(backup).unwrap();
        }

        let err = fx.guardian.verify_and_restore().await.unwrap_err();
        assert!(matches!(err, IntegrityError::RestoreExhausted { .. }));
    }

    #[tokio::test]
    async fn verify_without_manifest_errors() {
        let fx = fixture(StubArtifact::unreachable(), StubProbe::failing());
        assert!(matches!(
            fx.guardian.verify_and_restore().await,
            Err(IntegrityError::NoManifest(_))
        ));
    }
}
