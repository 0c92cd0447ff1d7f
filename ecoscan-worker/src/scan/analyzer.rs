//! The analyzer subprocess contract.
//!
//! The analyzer is invoked as `analyzer [-gomodcache PATH] [-clean] <MODE>
//! <PATH>` and writes a single JSON document to stdout:
//! `{ "Error": string?, "Vulns": [...] }`. A populated `Error` means the
//! analysis itself failed; anything else on stdout is a malformed run.

use ecoscan_model::VulnFinding;
use serde::Deserialize;
use thiserror::Error;

/// Module cache path as seen from inside the sandbox.
pub const SANDBOX_MOD_CACHE: &str = "/go/pkg/mod";

#[derive(Debug, Error)]
pub enum AnalyzerOutputError {
    #[error("unmarshaling analyzer output: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The analyzer ran and reported a failure in its envelope.
    #[error("{0}")]
    Reported(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

/// Parsed analyzer result.
#[derive(Debug, Default, Deserialize)]
pub struct AnalyzerReport {
    #[serde(rename = "Vulns", default)]
    pub vulns: Vec<AnalyzerVuln>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzerVuln {
    #[serde(rename = "OSV")]
    pub osv: OsvSummary,
    #[serde(rename = "Symbol", default)]
    pub symbol: String,
    #[serde(rename = "PkgPath", default)]
    pub package_path: String,
    #[serde(rename = "ModPath", default)]
    pub module_path: String,
    #[serde(rename = "CallSink", default)]
    pub call_sink: Option<i64>,
    #[serde(rename = "ImportSink", default)]
    pub import_sink: Option<i64>,
    #[serde(rename = "RequireSink", default)]
    pub require_sink: Option<i64>,
}

/// The only field of the OSV entry the row needs.
#[derive(Debug, Deserialize)]
pub struct OsvSummary {
    pub id: String,
}

impl From<AnalyzerVuln> for VulnFinding {
    fn from(vuln: AnalyzerVuln) -> Self {
        VulnFinding {
            id: vuln.osv.id,
            module_path: vuln.module_path,
            package_path: vuln.package_path,
            symbol: vuln.symbol,
            call_sink: vuln.call_sink,
            import_sink: vuln.import_sink,
            require_sink: vuln.require_sink,
        }
    }
}

/// Decodes analyzer stdout: the error envelope first, the full report only
/// when the envelope is clean.
pub fn parse_output(stdout: &[u8]) -> Result<AnalyzerReport, AnalyzerOutputError> {
    let envelope: Envelope = serde_json::from_slice(stdout)?;
    if let Some(error) = envelope.error.filter(|e| !e.is_empty()) {
        return Err(AnalyzerOutputError::Reported(error));
    }
    Ok(serde_json::from_slice(stdout)?)
}
