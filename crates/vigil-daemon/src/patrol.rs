//! The patrol daemon: primary work, self-protection, and keeping the warden
//! alive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{debug, info, warn};

use vigil_core::config::DaemonConfig;
use vigil_core::integrity::{IntegrityGuardian, Verification};
use vigil_core::process::ProcessLauncher;
use vigil_core::store::StateStore;
use vigil_core::types::{DaemonPhase, Role};

use crate::identity::Identity;
use crate::shutdown::ShutdownSignal;
use crate::watchdog::{advance_phase, ensure_partner_alive};

/// The primary periodic work the patrol runs. The actual policy (what to
/// sweep and how) is an external collaborator; the daemon only owns the
/// schedule.
pub trait SweepTask: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self) -> Result<()>;
}

/// Placeholder sweep for deployments with no policy wired in.
pub struct IdleSweep;

impl SweepTask for IdleSweep {
    fn name(&self) -> &str {
        "idle"
    }
    fn run(&self) -> Result<()> {
        debug!("no sweep policy configured");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PatrolIntervals {
    pub sweep: Duration,
    pub heartbeat: Duration,
    pub partner_check: Duration,
    pub integrity_check: Duration,
}

impl PatrolIntervals {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self {
            sweep: Duration::from_secs(cfg.sweep_interval_secs),
            heartbeat: Duration::from_secs(cfg.heartbeat_interval_secs),
            partner_check: Duration::from_secs(cfg.patrol_partner_check_secs),
            integrity_check: Duration::from_secs(cfg.integrity_check_secs),
        }
    }
}

impl Default for PatrolIntervals {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

pub struct PatrolDaemon {
    identity: Identity,
    intervals: PatrolIntervals,
    store: Arc<dyn StateStore>,
    guardian: Arc<IntegrityGuardian>,
    launcher: Arc<dyn ProcessLauncher>,
    sweep: Arc<dyn SweepTask>,
    shutdown: ShutdownSignal,
}

impl PatrolDaemon {
    pub fn new(
        identity: Identity,
        intervals: PatrolIntervals,
        store: Arc<dyn StateStore>,
        guardian: Arc<IntegrityGuardian>,
        launcher: Arc<dyn ProcessLauncher>,
        sweep: Arc<dyn SweepTask>,
    ) -> Self {
        Self {
            identity,
            intervals,
            store,
            guardian,
            launcher,
            sweep,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle for triggering shutdown from a signal handler or test.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the patrol loop until cancelled.
    ///
    /// Registration is the one fatal step: without a record in the store the
    /// warden can never discover this process, so dying loudly is better
    /// than running invisibly.
    pub async fn run(&self) -> Result<()> {
        let mut phase = DaemonPhase::Starting;

        self.store
            .register(
                Role::Patrol,
                self.identity.pid,
                &self.identity.process_name,
                &self.identity.app_version,
            )
            .context("failed to register patrol in the state store")?;
        advance_phase(&mut phase, DaemonPhase::Registered, Role::Patrol);

        info!(
            pid = self.identity.pid,
            name = %self.identity.process_name,
            "patrol daemon started"
        );

        // Eager pass of every periodic action before the timers take over.
        self.run_sweep();
        ensure_partner_alive(&self.store, &self.launcher, Role::Patrol);
        self.check_integrity().await;

        advance_phase(&mut phase, DaemonPhase::Running, Role::Patrol);

        let mut sweep_tick = interval(self.intervals.sweep);
        let mut heartbeat_tick = interval(self.intervals.heartbeat);
        let mut partner_tick = interval(self.intervals.partner_check);
        let mut integrity_tick = interval(self.intervals.integrity_check);

        // Consume the immediate first tick so the eager pass isn't repeated
        // at t=0.
        sweep_tick.tick().await;
        heartbeat_tick.tick().await;
        partner_tick.tick().await;
        integrity_tick.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = sweep_tick.tick() => self.run_sweep(),
                _ = heartbeat_tick.tick() => self.beat(),
                _ = partner_tick.tick() => {
                    ensure_partner_alive(&self.store, &self.launcher, Role::Patrol);
                }
                _ = integrity_tick.tick() => self.check_integrity().await,
                _ = shutdown_rx.recv() => {
                    info!("patrol daemon stopping");
                    break;
                }
            }
        }

        advance_phase(&mut phase, DaemonPhase::Stopping, Role::Patrol);
        advance_phase(&mut phase, DaemonPhase::Terminated, Role::Patrol);
        info!("patrol daemon stopped");
        Ok(())
    }

    fn run_sweep(&self) {
        if let Err(e) = self.sweep.run() {
            warn!(sweep = self.sweep.name(), error = %e, "sweep failed");
        }
    }

    fn beat(&self) {
        // Retried on the next tick; the loop's contract is to keep running.
        if let Err(e) = self.store.update_heartbeat(Role::Patrol) {
            warn!(error = %e, "heartbeat write failed");
        }
    }

    async fn check_integrity(&self) {
        match self.guardian.verify_and_restore().await {
            Ok(Verification::Intact) => debug!("binary intact"),
            Ok(Verification::LegitimateUpdate { version }) => {
                info!(version = %version, "external upgrade accepted, manifest refreshed");
            }
            Ok(Verification::Restored { source }) => {
                info!(?source, "binary was missing or corrupted, restored");
            }
            Err(e) => warn!(error = %e, "binary integrity check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vigil_core::store::StoreError;
    use vigil_core::types::{DaemonRecord, RegistryState};

    /// Store whose registry is permanently unavailable.
    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn register(&self, _: Role, _: u32, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }
        fn partner(&self, role: Role) -> Result<DaemonRecord, StoreError> {
            Err(StoreError::NotRegistered(role.partner()))
        }
        fn update_heartbeat(&self, role: Role) -> Result<(), StoreError> {
            Err(StoreError::NotRegistered(role))
        }
        fn is_partner_alive(&self, _: Role) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn get_all(&self) -> Result<Option<RegistryState>, StoreError> {
            Ok(None)
        }
        fn clear(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn get_secret(&self, key: &str) -> Result<String, StoreError> {
            Err(StoreError::SecretNotFound(key.into()))
        }
        fn set_secret(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn all_secrets(&self) -> Result<BTreeMap<String, String>, StoreError> {
            Ok(BTreeMap::new())
        }
    }

    struct NoopLauncher;
    impl ProcessLauncher for NoopLauncher {
        fn spawn_detached(
            &self,
            _: Role,
            _: &str,
        ) -> Result<(), vigil_core::process::SpawnError> {
            Ok(())
        }
    }

    struct FailingProbe;
    impl vigil_core::version::VersionProbe for FailingProbe {
        fn query(
            &self,
            binary: &std::path::Path,
        ) -> Result<String, vigil_core::version::VersionError> {
            Err(vigil_core::version::VersionError::Query {
                binary: binary.display().to_string(),
                reason: "unused".into(),
            })
        }
    }

    fn test_guardian(dir: &std::path::Path) -> Arc<IntegrityGuardian> {
        use vigil_core::artifact::{ArtifactError, ArtifactSource};

        struct DeadArtifact;

        #[async_trait::async_trait]
        impl ArtifactSource for DeadArtifact {
            async fn get_latest_version(&self) -> Result<String, ArtifactError> {
                Err(ArtifactError::Request("unreachable".into()))
            }
            async fn download_latest(&self, _dest: &std::path::Path) -> Result<(), ArtifactError> {
                Err(ArtifactError::Request("unreachable".into()))
            }
        }

        Arc::new(IntegrityGuardian::new(
            dir.join("manifest.json"),
            vec![dir.join("bk")],
            dir.join("unit"),
            Arc::new(DeadArtifact),
            Arc::new(FailingProbe),
        ))
    }

    #[tokio::test]
    async fn registration_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = PatrolDaemon::new(
            Identity::new(Role::Patrol, "test-ident", "0.1.0"),
            PatrolIntervals::default(),
            Arc::new(BrokenStore),
            test_guardian(dir.path()),
            Arc::new(NoopLauncher),
            Arc::new(IdleSweep),
        );

        let err = daemon.run().await.unwrap_err();
        assert!(err.to_string().contains("register"));
    }

    #[tokio::test]
    async fn integrity_tick_restores_a_corrupted_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("vigil");
        std::fs::write(&binary, b"good binary").unwrap();

        let guardian = test_guardian(dir.path());
        guardian.setup_backups(&binary, "0.1.0", "").unwrap();

        let key = vigil_core::keys::KeyFile::in_dir(dir.path()).ensure().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(
            vigil_core::store::FileStore::open(
                dir.path(),
                key,
                Arc::new(vigil_core::process::SystemProcesses),
            )
            .unwrap(),
        );

        let daemon = PatrolDaemon::new(
            Identity::new(Role::Patrol, "p-ident", "0.1.0"),
            PatrolIntervals {
                sweep: Duration::from_secs(60),
                heartbeat: Duration::from_secs(60),
                partner_check: Duration::from_secs(60),
                integrity_check: Duration::from_millis(50),
            },
            store,
            guardian,
            Arc::new(NoopLauncher),
            Arc::new(IdleSweep),
        );
        let shutdown = daemon.shutdown_handle();
        let handle = tokio::spawn(async move { daemon.run().await });

        // Let the eager pass see an intact binary, then corrupt it.
        tokio::time::sleep(Duration::from_millis(80)).await;
        std::fs::write(&binary, b"vandalized").unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(std::fs::read(&binary).unwrap(), b"good binary");

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }
}
