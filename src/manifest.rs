//! The JSON report written at the end of every run.
//!
//! ```json
//! {
//!   "status": "partial",
//!   "final_script_path": "/archive/FixFX/BOB/1/101/010/project/nuke/010_archive.nk",
//!   "dependencies": [
//!     { "original": "/src/plate.1001.exr", "destination": "...", "size": 1024, "status": "verified" },
//!     { "original": "/src/plate.1002.exr", "destination": "...", "status": "failed", "error": "..." }
//!   ],
//!   "warnings": ["missing file /src/plate.1002.exr referenced by Read1.file"],
//!   "errors": []
//! }
//! ```

use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::Warning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Verified,
    Failed,
    Simulated,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryStatus::Verified => "verified",
            EntryStatus::Failed => "failed",
            EntryStatus::Simulated => "simulated",
        })
    }
}

/// Outcome for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub original: Utf8PathBuf,
    /// `None` when no archive location could be built for the file.
    pub destination: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    /// Entry for a file that never got an archive location.
    pub fn unmapped(original: Utf8PathBuf, error: impl fmt::Display) -> Self {
        Self {
            original,
            destination: None,
            size: None,
            status: EntryStatus::Failed,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Ok => "ok",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub status: RunStatus,
    pub final_script_path: Option<Utf8PathBuf>,
    pub dependencies: Vec<ManifestEntry>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Report {
    /// Aggregates the outcome of a run that went all the way through.
    pub fn build(
        entries: Vec<ManifestEntry>,
        warnings: &[Warning],
        errors: Vec<String>,
        final_script_path: Option<Utf8PathBuf>,
    ) -> Self {
        let failed = entries.iter().filter(|e| e.status == EntryStatus::Failed).count();
        let succeeded = entries.len() - failed;

        let status = if failed == 0 && errors.is_empty() {
            RunStatus::Ok
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        Self {
            status,
            final_script_path,
            dependencies: entries,
            warnings: warnings.iter().map(Warning::to_string).collect(),
            errors,
        }
    }

    /// Report of a run that stopped on a fatal error.
    pub fn aborted(error: impl fmt::Display, warnings: &[Warning]) -> Self {
        Self {
            status: RunStatus::Failed,
            final_script_path: None,
            dependencies: Vec::new(),
            warnings: warnings.iter().map(Warning::to_string).collect(),
            errors: vec![error.to_string()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Ok
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.dependencies.iter().filter(|e| e.status == status).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.dependencies
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        tracing::info!(%path, "wrote report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, status: EntryStatus) -> ManifestEntry {
        ManifestEntry {
            original: format!("/src/{name}").into(),
            destination: Some(format!("/archive/{name}").into()),
            size: (status == EntryStatus::Verified).then_some(4),
            status,
            error: (status == EntryStatus::Failed).then(|| "source file is missing".to_string()),
        }
    }

    #[test]
    fn test_status_rules() {
        let ok = Report::build(vec![entry("a", EntryStatus::Verified)], &[], vec![], None);
        assert_eq!(ok.status, RunStatus::Ok);
        assert!(ok.is_success());

        let partial = Report::build(
            vec![entry("a", EntryStatus::Verified), entry("b", EntryStatus::Failed)],
            &[],
            vec![],
            None,
        );
        assert_eq!(partial.status, RunStatus::Partial);
        assert_eq!(partial.failed().count(), 1);

        let failed = Report::build(vec![entry("b", EntryStatus::Failed)], &[], vec![], None);
        assert_eq!(failed.status, RunStatus::Failed);

        let script_error = Report::build(vec![entry("a", EntryStatus::Verified)], &[], vec!["disk full".into()], None);
        assert_eq!(script_error.status, RunStatus::Partial);

        let simulated = Report::build(vec![entry("a", EntryStatus::Simulated)], &[], vec![], None);
        assert!(simulated.is_success());
    }

    #[test]
    fn test_warnings_do_not_fail_the_run() {
        let warnings = [Warning::UnknownTarget("Write9".into())];
        let report = Report::build(vec![entry("a", EntryStatus::Verified)], &warnings, vec![], None);
        assert!(report.is_success());
        assert_eq!(report.warnings, vec!["target node 'Write9' does not exist"]);
    }

    #[test]
    fn test_json_shape() {
        let report = Report::build(
            vec![entry("a", EntryStatus::Verified), entry("b", EntryStatus::Failed)],
            &[],
            vec![],
            Some("/archive/010_archive.nk".into()),
        );
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(json["status"], "partial");
        assert_eq!(json["final_script_path"], "/archive/010_archive.nk");
        assert_eq!(json["dependencies"][0]["original"], "/src/a");
        assert_eq!(json["dependencies"][0]["status"], "verified");
        assert_eq!(json["dependencies"][0]["size"], 4);
        assert!(json["dependencies"][0].get("error").is_none());
        assert_eq!(json["dependencies"][1]["status"], "failed");
        assert!(json["errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_aborted_report() {
        let report = Report::aborted("No target output nodes found in the script", &[]);
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.dependencies.is_empty());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("reports/run.json")).unwrap();
        Report::aborted("boom", &[]).write_json(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("\"failed\""));
    }
}
