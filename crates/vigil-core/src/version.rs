//! Version ordering and the version-query subprocess protocol.
//!
//! The installed binary reports its own version via `version --json`; the
//! integrity guardian uses that self-report to tell a legitimate external
//! upgrade apart from corruption.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("version query of {binary} failed: {reason}")]
    Query { binary: String, reason: String },
}

/// Payload of `vigil version --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
}

/// Dotted-numeric comparison: `current` strictly newer than `stored`?
///
/// Segments are compared as integers left-to-right; a missing or
/// non-numeric segment counts as 0. An empty stored version is older than
/// anything, so a manifest that never recorded a version always yields to
/// the binary's self-report.
pub fn is_newer_version(current: &str, stored: &str) -> bool {
    if stored.is_empty() {
        return true;
    }

    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let cur = parse(current);
    let old = parse(stored);

    for i in 0..cur.len().max(old.len()) {
        let c = cur.get(i).copied().unwrap_or(0);
        let o = old.get(i).copied().unwrap_or(0);
        if c != o {
            return c > o;
        }
    }
    false
}

/// Asks a binary for its version. Trait seam so tests can stub the answer
/// instead of shipping fixture executables.
pub trait VersionProbe: Send + Sync {
    fn query(&self, binary: &Path) -> Result<String, VersionError>;
}

/// Real probe: run `<binary> version --json` and parse one version token.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandVersionProbe;

impl VersionProbe for CommandVersionProbe {
    fn query(&self, binary: &Path) -> Result<String, VersionError> {
        let fail = |reason: String| VersionError::Query {
            binary: binary.display().to_string(),
            reason,
        };

        let output = Command::new(binary)
            .arg("version")
            .arg("--json")
            .output()
            .map_err(|e| fail(e.to_string()))?;
        if !output.status.success() {
            return Err(fail(format!("exited with {}", output.status)));
        }

        let info: VersionInfo =
            serde_json::from_slice(&output.stdout).map_err(|e| fail(e.to_string()))?;
        Ok(info.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_major_wins() {
        assert!(is_newer_version("1.0.0", "0.9.9"));
    }

    #[test]
    fn equal_versions_are_not_newer() {
        assert!(!is_newer_version("0.2.0", "0.2.0"));
    }

    #[test]
    fn extra_segment_breaks_the_tie() {
        assert!(is_newer_version("1.0.0.1", "1.0.0"));
        assert!(!is_newer_version("1.0.0", "1.0.0.1"));
    }

    #[test]
    fn empty_stored_version_is_always_older() {
        assert!(is_newer_version("0.0.1", ""));
        assert!(is_newer_version("anything", ""));
    }

    #[test]
    fn older_versions_are_rejected() {
        assert!(!is_newer_version("0.9.9", "1.0.0"));
        assert!(!is_newer_version("1.2.3", "1.2.4"));
    }

    #[test]
    fn non_numeric_segments_count_as_zero() {
        assert!(is_newer_version("1.x.1", "1.0.0"));
        assert!(!is_newer_version("x", "0.0.1"));
    }

    #[test]
    fn probe_reports_missing_binary() {
        let err = CommandVersionProbe
            .query(Path::new("/nonexistent/binary"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/binary"));
    }
}
