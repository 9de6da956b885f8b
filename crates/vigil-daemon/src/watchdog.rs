//! The partner-restart primitive shared by both supervision loops.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use vigil_core::process::ProcessLauncher;
use vigil_core::store::StateStore;
use vigil_core::types::{DaemonPhase, Role};

/// One liveness-check tick: if this role's partner is dead (or was never
/// registered), spawn a detached replacement with a fresh identity.
///
/// Failures are logged and swallowed: the check interval is the retry
/// policy, and it is sized to exceed worst-case spawn+register latency so a
/// slow-starting partner is never spawned twice.
pub fn ensure_partner_alive(
    store: &Arc<dyn StateStore>,
    launcher: &Arc<dyn ProcessLauncher>,
    own_role: Role,
) {
    let partner = own_role.partner();

    match store.is_partner_alive(own_role) {
        Ok(true) => {
            debug!(partner = %partner, "partner alive");
        }
        Ok(false) => {
            info!(partner = %partner, "partner not running, respawning");
            let identity = Uuid::new_v4().to_string();
            match launcher.spawn_detached(partner, &identity) {
                Ok(()) => info!(partner = %partner, "partner respawned"),
                Err(e) => error!(partner = %partner, error = %e, "partner respawn failed"),
            }
        }
        Err(e) => {
            error!(partner = %partner, error = %e, "partner liveness check failed");
        }
    }
}

/// Advance the lifecycle phase, logging the transition. Transitions are
/// driven by the loops themselves and always follow the legal order; the
/// debug assert keeps refactors honest.
pub fn advance_phase(phase: &mut DaemonPhase, next: DaemonPhase, role: Role) {
    debug_assert!(phase.can_transition_to(next), "{phase:?} -> {next:?}");
    debug!(role = %role, from = ?phase, to = ?next, "phase transition");
    *phase = next;
}
