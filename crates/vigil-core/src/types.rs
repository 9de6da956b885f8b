use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// The two cooperating daemon identities.
///
/// `Patrol` runs the primary periodic work plus the binary-integrity checks;
/// `Warden`'s only job is keeping the patrol alive. Each role runs as exactly
/// one OS process at a time, and each is the other's watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patrol,
    Warden,
}

impl Role {
    /// The role this role is responsible for keeping alive.
    pub fn partner(self) -> Role {
        match self {
            Role::Patrol => Role::Warden,
            Role::Warden => Role::Patrol,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patrol => "patrol",
            Role::Warden => "warden",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patrol" => Ok(Role::Patrol),
            "warden" => Ok(Role::Warden),
            other => Err(format!("unknown role {other:?} (expected patrol|warden)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// Whether the deployment runs as a per-user service or a system service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    User,
    System,
}

impl ExecutionMode {
    /// Detect from the effective UID: root means a system-level deployment.
    #[cfg(unix)]
    pub fn detect() -> ExecutionMode {
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            ExecutionMode::System
        } else {
            ExecutionMode::User
        }
    }

    #[cfg(not(unix))]
    pub fn detect() -> ExecutionMode {
        ExecutionMode::User
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::User => "user",
            ExecutionMode::System => "system",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Registry records
// ---------------------------------------------------------------------------

/// One role-process's entry in the shared registry.
///
/// Overwritten wholesale on each register; `last_heartbeat` is bumped
/// independently by the running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRecord {
    pub role: Role,
    pub pid: u32,
    /// Generated identity the process was launched under.
    pub process_name: String,
    /// Unix seconds of the last heartbeat write.
    pub last_heartbeat: i64,
    pub app_version: String,
}

/// Aggregate registry state: both role records plus deployment metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub records: BTreeMap<Role, DaemonRecord>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub app_version: String,
}

impl RegistryState {
    pub fn record(&self, role: Role) -> Option<&DaemonRecord> {
        self.records.get(&role)
    }
}

// ---------------------------------------------------------------------------
// Daemon lifecycle
// ---------------------------------------------------------------------------

/// Per-process lifecycle state machine.
///
/// `Starting -> Registered -> Running -> Stopping -> Terminated`; the only
/// exit from `Running` is cancellation. Invalid transitions are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    Starting,
    Registered,
    Running,
    Stopping,
    Terminated,
}

impl DaemonPhase {
    pub fn can_transition_to(self, target: DaemonPhase) -> bool {
        matches!(
            (self, target),
            (DaemonPhase::Starting, DaemonPhase::Registered)
                | (DaemonPhase::Registered, DaemonPhase::Running)
                | (DaemonPhase::Running, DaemonPhase::Stopping)
                | (DaemonPhase::Stopping, DaemonPhase::Terminated)
        )
    }
}

// ---------------------------------------------------------------------------
// Update results
// ---------------------------------------------------------------------------

/// Outcome of one self-update attempt. Returned to the caller, never
/// persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateResult {
    pub success: bool,
    pub previous_version: String,
    pub new_version: String,
    pub rolled_back: bool,
    pub rollback_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_is_symmetric() {
        assert_eq!(Role::Patrol.partner(), Role::Warden);
        assert_eq!(Role::Warden.partner(), Role::Patrol);
        assert_eq!(Role::Patrol.partner().partner(), Role::Patrol);
    }

    #[test]
    fn role_parses_from_str() {
        assert_eq!("patrol".parse::<Role>().unwrap(), Role::Patrol);
        assert_eq!("warden".parse::<Role>().unwrap(), Role::Warden);
        assert!("keeper".parse::<Role>().is_err());
    }

    #[test]
    fn registry_state_roundtrips_through_json() {
        let mut state = RegistryState {
            execution_mode: ExecutionMode::User,
            app_version: "0.1.0".into(),
            ..Default::default()
        };
        state.records.insert(
            Role::Patrol,
            DaemonRecord {
                role: Role::Patrol,
                pid: 4242,
                process_name: "f81d4fae-7dec".into(),
                last_heartbeat: 1_700_000_000,
                app_version: "0.1.0".into(),
            },
        );

        let json = serde_json::to_string(&state).unwrap();
        let parsed: RegistryState = serde_json::from_str(&json).unwrap();
        let rec = parsed.record(Role::Patrol).unwrap();
        assert_eq!(rec.pid, 4242);
        assert_eq!(rec.last_heartbeat, 1_700_000_000);
        assert!(parsed.record(Role::Warden).is_none());
    }

    #[test]
    fn phase_transitions_follow_the_lifecycle() {
        assert!(DaemonPhase::Starting.can_transition_to(DaemonPhase::Registered));
        assert!(DaemonPhase::Registered.can_transition_to(DaemonPhase::Running));
        assert!(DaemonPhase::Running.can_transition_to(DaemonPhase::Stopping));
        assert!(DaemonPhase::Stopping.can_transition_to(DaemonPhase::Terminated));
        // No skipping ahead and no resurrection.
        assert!(!DaemonPhase::Starting.can_transition_to(DaemonPhase::Running));
        assert!(!DaemonPhase::Running.can_transition_to(DaemonPhase::Terminated));
        assert!(!DaemonPhase::Terminated.can_transition_to(DaemonPhase::Starting));
    }
}
