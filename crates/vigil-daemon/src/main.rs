//! vigil: self-healing dual-daemon supervision agent.
//!
//! The same binary is every surface: `vigil daemon --role <r> --name <id>`
//! is what the roles self-exec to respawn each other, `vigil version --json`
//! is the version-query subprocess protocol, and `start`/`stop`/`status`/
//! `update` are the operator entry points.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use vigil_core::artifact::{ArtifactSource, GitHubReleases};
use vigil_core::config::{Config, StoreBackend};
use vigil_core::integrity::{IntegrityError, IntegrityGuardian};
use vigil_core::keys::KeyFile;
use vigil_core::process::{DetachedLauncher, ProcessLauncher, ProcessManager, SystemProcesses};
use vigil_core::store::{FileStore, SqliteStore, StateStore};
use vigil_core::types::{RegistryState, Role};
use vigil_core::update::{UpdateCoordinator, UpdateTuning};
use vigil_core::version::{CommandVersionProbe, VersionInfo};

use vigil_daemon::identity::Identity;
use vigil_daemon::patrol::{IdleSweep, PatrolDaemon, PatrolIntervals};
use vigil_daemon::shutdown::ShutdownSignal;
use vigil_daemon::telemetry;
use vigil_daemon::warden::{WardenDaemon, WardenIntervals};

const APP_NAME: &str = "vigil";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vigil", version, about = "Self-healing dual-daemon supervision agent")]
struct Cli {
    /// Alternate config file (default: ~/.vigil/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one role's supervision loop. Normally spawned detached by the
    /// partner role or by `start`, not run by hand.
    Daemon {
        #[arg(long, value_parser = parse_role)]
        role: Role,
        /// Generated identity for this process instance.
        #[arg(long)]
        name: String,
    },
    /// Start both role daemons detached.
    Start,
    /// Stop both role daemons (graceful, then forced).
    Stop,
    /// Show the registry: roles, PIDs, liveness, heartbeat age.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Check for the latest release and self-update with rollback.
    Update,
    /// Print version information.
    Version {
        #[arg(long)]
        json: bool,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    s.parse()
}

/// Everything a command needs, wired once from config.
struct Components {
    config: Config,
    store: Arc<dyn StateStore>,
    processes: Arc<dyn ProcessManager>,
    launcher: Arc<dyn ProcessLauncher>,
    artifact: Arc<dyn ArtifactSource>,
    guardian: Arc<IntegrityGuardian>,
}

impl Components {
    fn build(config: Config) -> Result<Self> {
        let data_dir = &config.paths.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let key = KeyFile::in_dir(data_dir)
            .ensure()
            .context("failed to load or generate the store key")?;

        let processes: Arc<dyn ProcessManager> = Arc::new(SystemProcesses);
        let store: Arc<dyn StateStore> = match config.store.backend {
            StoreBackend::File => Arc::new(
                FileStore::open(data_dir, key, processes.clone())
                    .context("failed to open file-backed state store")?,
            ),
            StoreBackend::Sqlite => Arc::new(
                SqliteStore::open(data_dir, key, processes.clone())
                    .context("failed to open sqlite state store")?,
            ),
        };

        let artifact: Arc<dyn ArtifactSource> = Arc::new(GitHubReleases::new(
            config.artifact.github_owner.clone(),
            config.artifact.github_repo.clone(),
        ));
        let guardian = Arc::new(IntegrityGuardian::new(
            config.paths.manifest_file(),
            config.paths.backup_dirs.clone(),
            config.paths.service_unit_path.clone(),
            artifact.clone(),
            Arc::new(CommandVersionProbe),
        ));

        let binary = installed_binary(&config, &guardian);
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(DetachedLauncher::new(binary));

        Ok(Self {
            config,
            store,
            processes,
            launcher,
            artifact,
            guardian,
        })
    }

    fn coordinator(&self) -> UpdateCoordinator {
        UpdateCoordinator::new(
            self.artifact.clone(),
            self.guardian.clone(),
            self.store.clone(),
            self.processes.clone(),
            self.launcher.clone(),
            APP_VERSION,
            self.config.paths.install_path.clone(),
            UpdateTuning {
                stop_grace: self.config.stop_grace(),
                health_timeout: self.config.health_timeout(),
                poll_interval: self.config.health_poll(),
            },
        )
    }
}

/// The binary new spawns should self-exec: the manifest's record when one
/// exists, then the configured install path, then this very executable.
fn installed_binary(config: &Config, guardian: &IntegrityGuardian) -> PathBuf {
    if let Some(path) = guardian.main_binary_path() {
        return path;
    }
    if config.paths.install_path.exists() {
        return config.paths.install_path.clone();
    }
    std::env::current_exe().unwrap_or_else(|_| config.paths.install_path.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The version-query protocol: clean stdout, nothing else initialized.
    if let Commands::Version { json } = &cli.command {
        let info = VersionInfo {
            name: APP_NAME.into(),
            version: APP_VERSION.into(),
        };
        if *json {
            println!("{}", serde_json::to_string(&info)?);
        } else {
            println!("{} {}", info.name, info.version);
        }
        return Ok(());
    }

    telemetry::init_logging(APP_NAME, "info");

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Daemon { role, name } => run_daemon(config, role, name).await,
        Commands::Start => start_roles(config),
        Commands::Stop => stop_roles(config).await,
        Commands::Status { json } => show_status(config, json),
        Commands::Update => run_update(config).await,
        Commands::Version { .. } => unreachable!("handled above"),
    }
}

async fn run_daemon(config: Config, role: Role, name: String) -> Result<()> {
    let components = Components::build(config)?;
    let identity = Identity::new(role, name, APP_VERSION);

    match role {
        Role::Patrol => {
            let daemon = PatrolDaemon::new(
                identity,
                PatrolIntervals::from_config(&components.config.daemon),
                components.store,
                components.guardian,
                components.launcher,
                Arc::new(IdleSweep),
            );
            wire_signals(daemon.shutdown_handle());
            daemon.run().await
        }
        Role::Warden => {
            let daemon = WardenDaemon::new(
                identity,
                WardenIntervals::from_config(&components.config.daemon),
                components.store,
                components.launcher,
            );
            wire_signals(daemon.shutdown_handle());
            daemon.run().await
        }
    }
}

/// Trigger cooperative shutdown on ctrl-c or SIGTERM.
fn wire_signals(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        shutdown.trigger();
    });
}

fn start_roles(config: Config) -> Result<()> {
    let components = Components::build(config)?;

    // First start on a fresh deployment: seed the backup set so the
    // integrity guardian has something to verify against.
    if matches!(
        components.guardian.manifest(),
        Err(IntegrityError::NoManifest(_))
    ) {
        let binary = installed_binary(&components.config, &components.guardian);
        if binary.exists() {
            components
                .guardian
                .setup_backups(&binary, APP_VERSION, "")
                .context("failed to seed backups")?;
        }
    }

    for role in [Role::Patrol, Role::Warden] {
        components
            .launcher
            .spawn_detached(role, &uuid::Uuid::new_v4().to_string())
            .with_context(|| format!("failed to start {role}"))?;
        info!(role = %role, "role started");
    }
    println!("both roles started");
    Ok(())
}

async fn stop_roles(config: Config) -> Result<()> {
    let components = Components::build(config)?;
    components
        .coordinator()
        .stop_roles()
        .await
        .context("failed to stop roles")?;
    println!("both roles stopped");
    Ok(())
}

#[derive(Serialize)]
struct RoleStatus {
    role: Role,
    pid: u32,
    alive: bool,
    heartbeat_age_secs: i64,
    process_name: String,
}

#[derive(Serialize)]
struct StatusReport {
    registry: RegistryState,
    roles: Vec<RoleStatus>,
}

fn show_status(config: Config, json: bool) -> Result<()> {
    let components = Components::build(config)?;

    let Some(state) = components.store.get_all()? else {
        println!("no roles registered");
        return Ok(());
    };

    let now = chrono::Utc::now().timestamp();
    let roles: Vec<RoleStatus> = state
        .records
        .values()
        .map(|rec| RoleStatus {
            role: rec.role,
            pid: rec.pid,
            alive: components.processes.is_running(rec.pid),
            heartbeat_age_secs: (now - rec.last_heartbeat).max(0),
            process_name: rec.process_name.clone(),
        })
        .collect();

    if json {
        let report = StatusReport {
            registry: state,
            roles,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "mode: {}   version: {}",
        state.execution_mode, state.app_version
    );
    for status in roles {
        let liveness = if status.alive { "alive" } else { "stale" };
        println!(
            "{:<7} pid={:<7} {}  heartbeat {}s ago  ({})",
            status.role.to_string(),
            status.pid,
            liveness,
            status.heartbeat_age_secs,
            status.process_name,
        );
    }
    Ok(())
}

async fn run_update(config: Config) -> Result<()> {
    let components = Components::build(config)?;
    let coordinator = components.coordinator();

    let check = coordinator.check_update().await?;
    if !check.available {
        println!("already up to date ({})", check.current);
        return Ok(());
    }
    println!("updating {} -> {}", check.current, check.latest);

    let result = coordinator.perform_update().await?;
    if result.success {
        println!("updated to {}", result.new_version);
    } else if result.rolled_back {
        println!(
            "update rolled back: {}",
            result.rollback_reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
