// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Compatibility status published for external monitoring

use crate::compat::CompatibilityState;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: CompatibilityState,
    pub code: u8,
    pub updated_at: String,
}

impl StatusReport {
    pub fn now(state: CompatibilityState) -> Self {
        Self {
            state,
            code: state.as_code(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Writes a [`StatusReport`] on every transition, replacing the file atomically.
#[derive(Clone, Debug)]
pub struct StatusReporter {
    path: PathBuf,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(&self, state: CompatibilityState) {
        if let Err(e) = self.write(&StatusReport::now(state)) {
            warn!(operation = "publish_status", path = %self.path.display(), error = %e, "Failed to publish status");
        } else {
            debug!(operation = "publish_status", path = %self.path.display(), %state, "Published status");
        }
    }

    /// Remove the published report; a daemon that is gone has no state.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(operation = "clear_status", path = %self.path.display(), "Removed status report");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(operation = "clear_status", path = %self.path.display(), error = %e, "Failed to remove status report");
            }
        }
    }

    fn write(&self, report: &StatusReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_previous_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reporter = StatusReporter::new(dir.path().join("state/status.json"));

        reporter.publish(CompatibilityState::Ok);
        reporter.publish(CompatibilityState::MacPermissive);

        let report = StatusReport::read(reporter.path()).expect("report");
        assert_eq!(report.state, CompatibilityState::MacPermissive);
        assert_eq!(report.code, 3);
        assert!(!dir.path().join("state/status.json.tmp").exists());

        let raw = std::fs::read_to_string(reporter.path()).expect("raw");
        assert!(raw.contains("\"MAC_PERMISSIVE\""));
    }

    #[test]
    fn clear_removes_report_and_tolerates_absence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reporter = StatusReporter::new(dir.path().join("status.json"));

        reporter.publish(CompatibilityState::Ok);
        reporter.clear();
        assert!(!reporter.path().exists());
        reporter.clear();

        let err = StatusReport::read(reporter.path()).unwrap_err();
        assert!(matches!(err, crate::error::DaemonError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[test]
    fn malformed_report_is_a_json_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");
        std::fs::write(&path, "{ \"state\": ").expect("write");

        let err = StatusReport::read(&path).unwrap_err();
        assert!(matches!(err, crate::error::DaemonError::Json(_)));
    }
}
