//! Result rows appended to the analytics store, and the work version that
//! partitions them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one analytical generation. Two work versions are equal iff all
/// three fields match; a stored row whose work version equals the current one
/// does not need re-scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkVersion {
    /// Revision of the analyzer binary.
    pub analyzer_version: String,
    /// Last-modified stamp of the vulnerability database snapshot.
    pub vulndb_last_modified: Option<DateTime<Utc>>,
    /// Revision of the result-row schema.
    pub schema_version: String,
}

/// One vulnerability finding reported by the analyzer.
///
/// The three sinks are offsets into the analyzer's internal graph identifying
/// the call, import, and require positions; absent when the corresponding
/// analysis level did not run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnFinding {
    pub id: String,
    pub module_path: String,
    pub package_path: String,
    pub symbol: String,
    pub call_sink: Option<i64>,
    pub import_sink: Option<i64>,
    pub require_sink: Option<i64>,
}

/// A single row of the analytics table. Exactly one of `vulns` and `error`
/// carries the outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRecord {
    pub module_path: String,
    pub version: String,
    /// Lexicographically-orderable rewrite of `version`.
    pub sort_version: String,
    pub commit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suffix: String,
    pub imported_by: i64,
    pub scan_mode: String,
    /// Wall-clock seconds of the analyzer run.
    pub scan_seconds: f64,
    /// Peak heap bytes observed during the analyzer run, minus the pre-scan
    /// baseline.
    pub scan_memory: i64,
    /// Heap growth attributable to fetching and loading the module.
    pub pkgs_memory: i64,
    /// Configured request concurrency of the worker; -1 when unknown.
    pub workers: i64,
    pub vulndb_last_modified: Option<DateTime<Utc>>,
    pub work_version: WorkVersion,
    #[serde(default)]
    pub vulns: Vec<VulnFinding>,
    /// Full error message of a failed scan.
    pub error: Option<String>,
    /// Stable error code, one of the taxonomy written by the worker.
    pub error_category: Option<String>,
}

impl ScanRecord {
    /// Marks the row failed. Any previously collected vulns are discarded so
    /// the row carries exactly one outcome.
    pub fn add_error(&mut self, category: &str, message: impl Into<String>) {
        self.vulns.clear();
        self.error = Some(message.into());
        self.error_category = Some(category.to_string());
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_version_equality_is_three_way() {
        let a = WorkVersion {
            analyzer_version: "v1".into(),
            vulndb_last_modified: None,
            schema_version: "3".into(),
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.schema_version = "4".into();
        assert_ne!(a, b);
        let mut c = a.clone();
        c.vulndb_last_modified = Some(Utc::now());
        assert_ne!(a, c);
    }

    #[test]
    fn add_error_replaces_vulns() {
        let mut row = ScanRecord {
            vulns: vec![VulnFinding {
                id: "GO-2022-0001".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        row.add_error("PROXY_ERROR", "fetch failed");
        assert!(row.vulns.is_empty());
        assert_eq!(row.error_category.as_deref(), Some("PROXY_ERROR"));
        assert!(!row.is_success());
    }
}
