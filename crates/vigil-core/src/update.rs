//! Self-update state machine with rollback.
//!
//! `CheckUpdate -> Snapshot -> Obtain -> StopRoles -> Install ->
//! RefreshBackups -> StartRoles -> VerifyHealth -> Done`, where every step
//! after Snapshot can divert into rollback. The contract that matters: an
//! update attempt must never leave the system worse off than before it
//! started. The single exception, rollback itself failing its health
//! re-verification, is surfaced as a distinct critical outcome.
//!
//! The coordinator assumes external serialization; two concurrent update
//! attempts are not safe.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{download_to_temp, ArtifactError, ArtifactSource};
use crate::fsutil;
use crate::integrity::{IntegrityError, IntegrityGuardian};
use crate::process::{ProcessLauncher, ProcessManager};
use crate::store::{StateStore, StoreError};
use crate::types::{Role, UpdateResult};
use crate::version::is_newer_version;

/// How the post-update health verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HealthFailure {
    #[error("neither role alive")]
    Neither,
    #[error("only {0} alive")]
    Only(Role),
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("artifact source: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("state store unreadable: {0}")]
    Store(#[from] StoreError),
    #[error("snapshot: {0}")]
    Snapshot(std::io::Error),
    #[error(
        "critical: update rollback failed ({rollback}); original failure: {original}; \
         system state unknown, operator intervention required"
    )]
    CriticalRollbackFailure { original: String, rollback: String },
}

#[derive(Debug, Clone)]
pub struct UpdateCheck {
    pub current: String,
    pub latest: String,
    pub available: bool,
}

/// Timing knobs for the stop/verify phases.
#[derive(Debug, Clone)]
pub struct UpdateTuning {
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Total budget for post-start health verification.
    pub health_timeout: Duration,
    /// Poll interval while verifying health.
    pub poll_interval: Duration,
}

impl Default for UpdateTuning {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(2),
            health_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct UpdateCoordinator {
    artifact: Arc<dyn ArtifactSource>,
    guardian: Arc<IntegrityGuardian>,
    store: Arc<dyn StateStore>,
    processes: Arc<dyn ProcessManager>,
    launcher: Arc<dyn ProcessLauncher>,
    current_version: String,
    /// Install location used when no manifest has recorded one yet.
    install_path: PathBuf,
    tuning: UpdateTuning,
}

impl UpdateCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        artifact: Arc<dyn ArtifactSource>,
        guardian: Arc<IntegrityGuardian>,
        store: Arc<dyn StateStore>,
        processes: Arc<dyn ProcessManager>,
        launcher: Arc<dyn ProcessLauncher>,
        current_version: impl Into<String>,
        install_path: impl Into<PathBuf>,
        tuning: UpdateTuning,
    ) -> Self {
        Self {
            artifact,
            guardian,
            store,
            processes,
            launcher,
            current_version: current_version.into(),
            install_path: install_path.into(),
            tuning,
        }
    }

    /// Compare the published latest version against ours. No side effects.
    pub async fn check_update(&self) -> Result<UpdateCheck, UpdateError> {
        let latest = self.artifact.get_latest_version().await?;
        let available = is_newer_version(&latest, &self.current_version);
        Ok(UpdateCheck {
            current: self.current_version.clone(),
            latest,
            available,
        })
    }

    /// Run one full update attempt.
    ///
    /// Returns `Ok` with a rolled-back result for recoverable failures; only
    /// store-unreadable, pre-snapshot errors, and critical rollback failures
    /// surface as `Err`.
    pub async fn perform_update(&self) -> Result<UpdateResult, UpdateError> {
        let mut result = UpdateResult {
            previous_version: self.current_version.clone(),
            ..Default::default()
        };

        let check = self.check_update().await?;
        if !check.available {
            result.success = true;
            result.new_version = self.current_version.clone();
            return Ok(result);
        }
        result.new_version = check.latest.clone();
        info!(current = %check.current, latest = %check.latest, "update available");

        let binary = self
            .guardian
            .main_binary_path()
            .unwrap_or_else(|| self.install_path.clone());

        // Snapshot: ephemeral rollback source, distinct from the backup set.
        let snapshot_dir = std::env::temp_dir().join(format!("vigil-rollback-{}", Uuid::new_v4()));
        fs::create_dir_all(&snapshot_dir).map_err(UpdateError::Snapshot)?;
        let snapshot = snapshot_dir.join("vigil-prev");
        if let Err(e) = fsutil::atomic_copy(&binary, &snapshot) {
            let _ = fs::remove_dir_all(&snapshot_dir);
            return Err(UpdateError::Snapshot(e));
        }

        let outcome = self
            .run_from_obtain(&mut result, &binary, &snapshot, &check.latest)
            .await;
        let _ = fs::remove_dir_all(&snapshot_dir);
        outcome?;
        Ok(result)
    }

    async fn run_from_obtain(
        &self,
        result: &mut UpdateResult,
        binary: &Path,
        snapshot: &Path,
        new_version: &str,
    ) -> Result<(), UpdateError> {
        // Obtain: nothing on disk has changed yet, so a download failure
        // needs no rollback.
        let fetched = download_to_temp(self.artifact.as_ref()).await?;
        let fetched_dir = fetched.parent().map(Path::to_path_buf);

        let outcome = self
            .install_and_verify(result, binary, snapshot, &fetched, new_version)
            .await;
        if let Some(dir) = fetched_dir {
            let _ = fs::remove_dir_all(dir);
        }
        outcome
    }

    async fn install_and_verify(
        &self,
        result: &mut UpdateResult,
        binary: &Path,
        snapshot: &Path,
        fetched: &Path,
        new_version: &str,
    ) -> Result<(), UpdateError> {
        // StopRoles: an unreadable store is fatal (we cannot know what to
        // stop). Signal failures are not.
        self.stop_roles().await?;

        // Install: atomic replacement of the executable.
        info!(binary = %binary.display(), "installing new binary");
        if let Err(e) = fsutil::atomic_copy(fetched, binary) {
            // Nothing downstream has changed yet: restore the snapshot and
            // restart with the prior binary. No deeper rollback chain.
            warn!(error = %e, "install failed, restoring snapshot");
            if let Err(rb) = fsutil::atomic_copy(snapshot, binary) {
                return Err(UpdateError::CriticalRollbackFailure {
                    original: format!("install failed: {e}"),
                    rollback: format!("snapshot restore failed: {rb}"),
                });
            }
            let _ = fsutil::mark_executable(binary);
            if let Err(start) = self.start_roles() {
                warn!(error = %start, "failed to restart roles after install rollback");
            }
            result.rolled_back = true;
            result.rollback_reason = Some(format!("install failed: {e}"));
            return Ok(());
        }
        let _ = fsutil::mark_executable(binary);

        // Checkpoints: each failure from here is a full rollback.
        if let Err(reason) = self.finish_checkpoints(binary, new_version).await {
            warn!(reason = %reason, "update checkpoint failed, rolling back");
            result.rolled_back = true;
            result.rollback_reason = Some(reason.clone());
            self.rollback(snapshot, binary)
                .await
                .map_err(|rollback| UpdateError::CriticalRollbackFailure {
                    original: reason,
                    rollback,
                })?;
            return Ok(());
        }

        info!(version = %new_version, "update successful");
        result.success = true;
        Ok(())
    }

    async fn finish_checkpoints(&self, binary: &Path, new_version: &str) -> Result<(), String> {
        self.guardian
            .setup_backups(binary, new_version, "")
            .map_err(|e: IntegrityError| format!("failed to refresh backups: {e}"))?;
        self.start_roles()
            .map_err(|e| format!("failed to start roles: {e}"))?;
        self.verify_health(self.tuning.health_timeout)
            .await
            .map_err(|e| format!("health check failed: {e}"))?;
        Ok(())
    }

    /// Gracefully stop both role processes, escalating to SIGKILL after the
    /// grace window.
    pub async fn stop_roles(&self) -> Result<(), StoreError> {
        let Some(state) = self.store.get_all()? else {
            return Ok(()); // nothing registered, nothing to stop
        };

        for record in state.records.values() {
            if self.processes.is_running(record.pid) {
                info!(role = %record.role, pid = record.pid, "stopping role");
                if let Err(e) = self.processes.terminate(record.pid) {
                    // Non-fatal: the process may have exited on its own.
                    warn!(pid = record.pid, error = %e, "terminate signal failed");
                }
            }
        }

        sleep(self.tuning.stop_grace).await;

        for record in state.records.values() {
            if self.processes.is_running(record.pid) {
                warn!(role = %record.role, pid = record.pid, "force-killing role");
                let _ = self.processes.kill(record.pid);
            }
        }
        Ok(())
    }

    /// Spawn both roles detached with fresh identities.
    pub fn start_roles(&self) -> Result<(), String> {
        for role in [Role::Patrol, Role::Warden] {
            self.launcher
                .spawn_detached(role, &Uuid::new_v4().to_string())
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Poll the store until both roles show a live PID or the timeout lapses.
    pub async fn verify_health(&self, timeout: Duration) -> Result<(), HealthFailure> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.roles_alive() == (true, true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.tuning.poll_interval).await;
        }

        match self.roles_alive() {
            (true, true) => Ok(()),
            (true, false) => Err(HealthFailure::Only(Role::Patrol)),
            (false, true) => Err(HealthFailure::Only(Role::Warden)),
            (false, false) => Err(HealthFailure::Neither),
        }
    }

    fn roles_alive(&self) -> (bool, bool) {
        let state = match self.store.get_all() {
            Ok(Some(state)) => state,
            _ => return (false, false),
        };
        let alive = |role: Role| {
            state
                .record(role)
                .map(|r| self.processes.is_running(r.pid))
                .unwrap_or(false)
        };
        (alive(Role::Patrol), alive(Role::Warden))
    }

    /// Full rollback after a failed checkpoint: stop whatever started,
    /// restore the snapshot, refresh backups to the restored version,
    /// restart both roles, and re-verify health.
    async fn rollback(&self, snapshot: &Path, binary: &Path) -> Result<(), String> {
        info!("performing rollback");
        let _ = self.stop_roles().await;

        fsutil::atomic_copy(snapshot, binary)
            .map_err(|e| format!("failed to restore snapshot: {e}"))?;
        let _ = fsutil::mark_executable(binary);

        if let Err(e) = self
            .guardian
            .setup_backups(binary, &self.current_version, "")
        {
            // The binary is back; stale backups can be refreshed later.
            warn!(error = %e, "failed to refresh backups during rollback");
        }

        self.start_roles()
            .map_err(|e| format!("failed to restart roles: {e}"))?;
        self.verify_health(self.tuning.health_timeout)
            .await
            .map_err(|e| format!("roles unhealthy after rollback: {e}"))
    }
}
