//! OS process operations: liveness probing, signalling, detached spawning.
//!
//! Everything here is behind traits so the stores, supervision loops, and
//! the update coordinator can be driven by stubs in tests.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::types::Role;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {role} from {binary}: {source}")]
    Spawn {
        role: Role,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Liveness probe and signal delivery for arbitrary PIDs.
pub trait ProcessManager: Send + Sync {
    /// Whether the PID refers to a running, signalable process.
    fn is_running(&self, pid: u32) -> bool;

    /// Graceful-terminate request (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<(), SignalError>;

    /// Forced kill (SIGKILL).
    fn kill(&self, pid: u32) -> Result<(), SignalError>;
}

/// Spawner for detached role processes.
///
/// The launched child gets the partner's role name and a freshly generated
/// identity argument, a new session, and no inherited stdio; it must
/// outlive whichever process spawned it.
pub trait ProcessLauncher: Send + Sync {
    fn spawn_detached(&self, role: Role, identity: &str) -> Result<(), SpawnError>;
}

// ---------------------------------------------------------------------------
// Real implementations
// ---------------------------------------------------------------------------

/// [`ProcessManager`] backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessManager for SystemProcesses {
    #[cfg(unix)]
    fn is_running(&self, pid: u32) -> bool {
        // SAFETY: signal 0 probes existence without delivering anything.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    fn is_running(&self, _pid: u32) -> bool {
        true
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<(), SignalError> {
        send_signal(pid, libc::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> Result<(), SignalError> {
        Ok(())
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> Result<(), SignalError> {
        send_signal(pid, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: u32) -> Result<(), SignalError> {
        Ok(())
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: libc::c_int) -> Result<(), SignalError> {
    // SAFETY: kill with a valid signal number; failure shows up as -1/errno.
    if unsafe { libc::kill(pid as i32, sig) } == 0 {
        Ok(())
    } else {
        Err(SignalError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

/// [`ProcessLauncher`] that self-execs the installed binary.
///
/// Invocation contract: `<binary> daemon --role <role> --name <identity>`,
/// `setsid`'d into a new session with stdio on /dev/null.
pub struct DetachedLauncher {
    binary: PathBuf,
}

impl DetachedLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

impl ProcessLauncher for DetachedLauncher {
    fn spawn_detached(&self, role: Role, identity: &str) -> Result<(), SpawnError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("daemon")
            .arg("--role")
            .arg(role.as_str())
            .arg("--name")
            .arg(identity)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and touches no process
            // state shared with the parent.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        // Fire-and-forget: the child is intentionally not reaped here; it
        // detaches into its own session and registers itself in the store.
        cmd.spawn()
            .map(|child| {
                debug!(role = %role, pid = child.id(), "spawned detached partner");
            })
            .map_err(|source| SpawnError::Spawn {
                role,
                binary: self.binary.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_running() {
        assert!(SystemProcesses.is_running(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_not_running() {
        // PID 4_000_000 exceeds any default pid_max.
        assert!(!SystemProcesses.is_running(4_000_000));
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_dead_pid_fails() {
        assert!(SystemProcesses.terminate(4_000_000).is_err());
        assert!(SystemProcesses.kill(4_000_000).is_err());
    }

    #[test]
    fn spawn_from_missing_binary_reports_role_and_path() {
        let launcher = DetachedLauncher::new("/nonexistent/vigil-binary");
        let err = launcher
            .spawn_detached(Role::Warden, "test-identity")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("warden"));
        assert!(msg.contains("/nonexistent/vigil-binary"));
    }
}
