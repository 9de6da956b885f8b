//! The vigil daemon runtime: per-role supervision loops and the cooperative
//! shutdown machinery that stops them.
//!
//! Two role processes run these loops against the shared state store in
//! `vigil-core`; each role is the other's watchdog.

pub mod identity;
pub mod patrol;
pub mod shutdown;
pub mod telemetry;
pub mod warden;
pub mod watchdog;
