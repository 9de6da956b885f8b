//! The warden daemon. The simpler of the two loops: its whole job is
//! keeping the patrol alive and proving its own liveness.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{info, warn};

use vigil_core::config::DaemonConfig;
use vigil_core::process::ProcessLauncher;
use vigil_core::store::StateStore;
use vigil_core::types::{DaemonPhase, Role};

use crate::identity::Identity;
use crate::shutdown::ShutdownSignal;
use crate::watchdog::{advance_phase, ensure_partner_alive};

#[derive(Debug, Clone)]
pub struct WardenIntervals {
    pub heartbeat: Duration,
    pub partner_check: Duration,
}

impl WardenIntervals {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self {
            heartbeat: Duration::from_secs(cfg.heartbeat_interval_secs),
            partner_check: Duration::from_secs(cfg.warden_partner_check_secs),
        }
    }
}

impl Default for WardenIntervals {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

pub struct WardenDaemon {
    identity: Identity,
    intervals: WardenIntervals,
    store: Arc<dyn StateStore>,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: ShutdownSignal,
}

impl WardenDaemon {
    pub fn new(
        identity: Identity,
        intervals: WardenIntervals,
        store: Arc<dyn StateStore>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            identity,
            intervals,
            store,
            launcher,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the warden loop until cancelled. Registration failure is fatal.
    pub async fn run(&self) -> Result<()> {
        let mut phase = DaemonPhase::Starting;

        self.store
            .register(
                Role::Warden,
                self.identity.pid,
                &self.identity.process_name,
                &self.identity.app_version,
            )
            .context("failed to register warden in the state store")?;
        advance_phase(&mut phase, DaemonPhase::Registered, Role::Warden);

        info!(
            pid = self.identity.pid,
            name = %self.identity.process_name,
            "warden daemon started"
        );

        // Eager partner check; the register call just wrote our heartbeat.
        ensure_partner_alive(&self.store, &self.launcher, Role::Warden);

        advance_phase(&mut phase, DaemonPhase::Running, Role::Warden);

        let mut partner_tick = interval(self.intervals.partner_check);
        let mut heartbeat_tick = interval(self.intervals.heartbeat);
        partner_tick.tick().await;
        heartbeat_tick.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = partner_tick.tick() => {
                    ensure_partner_alive(&self.store, &self.launcher, Role::Warden);
                }
                _ = heartbeat_tick.tick() => {
                    if let Err(e) = self.store.update_heartbeat(Role::Warden) {
                        warn!(error = %e, "heartbeat write failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("warden daemon stopping");
                    break;
                }
            }
        }

        advance_phase(&mut phase, DaemonPhase::Stopping, Role::Warden);
        advance_phase(&mut phase, DaemonPhase::Terminated, Role::Warden);
        info!("warden daemon stopped");
        Ok(())
    }
}
