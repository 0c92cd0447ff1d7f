//! Scan requests as carried by queue tasks and the scan endpoint.

use serde::{Deserialize, Serialize};

use crate::coordinate::ModuleUrlPath;

/// Query parameters attached to a scan request.
///
/// `mode` stays a free-form string here: the planner round-trips whatever
/// mode names it was given through task URLs, and only the worker validates
/// them against the known [`crate::ScanMode`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequestParams {
    /// Number of importers of the module, a popularity metric.
    pub imported_by: i64,
    pub mode: String,
    /// Scan without sandbox isolation.
    pub insecure: bool,
}

/// A single scan of one module version. Immutable once parsed; owned by the
/// scanner that executes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(flatten)]
    pub coordinate: ModuleUrlPath,
    #[serde(flatten)]
    pub params: ScanRequestParams,
}

impl ScanRequest {
    /// Log-friendly `module@version[/suffix]`.
    pub fn path(&self) -> String {
        self.coordinate.to_string()
    }

    /// The relative URL path plus query string used when addressing this
    /// request at a worker, e.g.
    /// `mod/@v/v1.2.3?importedby=0&mode=VTA&insecure=false`.
    pub fn url_path_and_params(&self) -> String {
        format!(
            "{}?importedby={}&mode={}&insecure={}",
            self.coordinate.url_path(),
            self.params.imported_by,
            self.params.mode,
            self.params.insecure,
        )
    }
}
