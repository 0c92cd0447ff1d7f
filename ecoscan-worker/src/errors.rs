//! Scan error taxonomy and the HTTP-facing error type.
//!
//! Every scan failure is recovered and recorded; the stable codes returned
//! by [`ScanError::code`] are written into result rows and consumed by
//! downstream analytics, so they must not change.

use std::fmt;
use std::path::Path;
use std::process::Output;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// A classified scan failure. The display string becomes the row's error
/// message; [`ScanError::code`] becomes its category.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("proxy: {0}")]
    Proxy(String),
    #[error("bad module: {0}")]
    BadModule(String),
    #[error("no go.mod: {0}")]
    LoadNoGoMod(String),
    #[error("no go.sum: {0}")]
    LoadNoGoSum(String),
    #[error("no required module: {0}")]
    LoadNoRequiredModule(String),
    #[error("missing go.sum entry: {0}")]
    LoadMissingGoSumEntry(String),
    #[error("loading packages: {0}")]
    LoadPackages(String),
    #[error("vulncheck: {0}")]
    Vulncheck(String),
    #[error("vulndb connection: {0}")]
    VulnDbConnection(String),
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    #[error("panic: {0}")]
    Panic(String),
    #[error("analytics: {0}")]
    Analytics(String),
    #[error("sandbox exit: {0}")]
    SandboxExit(String),
    #[error("sandbox launch: {0}")]
    SandboxLaunch(String),
}

impl ScanError {
    /// The stable code recorded in the row's error category.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ScanError::Proxy(_) => "PROXY_ERROR",
            ScanError::BadModule(_) => "BAD_MODULE",
            ScanError::LoadNoGoMod(_) => "LOAD_NO_GO_MOD",
            ScanError::LoadNoGoSum(_) => "LOAD_NO_GO_SUM",
            ScanError::LoadNoRequiredModule(_) => "LOAD_NO_REQUIRED_MODULE",
            ScanError::LoadMissingGoSumEntry(_) => "LOAD_MISSING_GO_SUM_ENTRY",
            ScanError::LoadPackages(_) => "LOAD_PACKAGES",
            ScanError::Vulncheck(_) => "VULNCHECK_ERROR",
            ScanError::VulnDbConnection(_) => "VULNDB_CONNECTION",
            ScanError::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ScanError::Panic(_) => "PANIC",
            ScanError::Analytics(_) => "ANALYTICS_ERROR",
            ScanError::SandboxExit(_) => "SANDBOX_EXIT",
            ScanError::SandboxLaunch(_) => "SANDBOX_LAUNCH",
        }
    }
}

/// Detects vulnerability-database transport failures from the analyzer's
/// error text. Substring matching is fragile but the downstream analytics
/// depend on this code; keep the heuristic in this one place.
pub fn is_vulndb_connection(message: &str, db_host: &str) -> bool {
    message.contains(db_host) && message.contains("connection")
}

/// Classifies a package-load failure reported while scanning module source
/// outside the sandbox. File checks run against the scratch directory root;
/// the remaining cases match on the analyzer's error text.
pub fn classify_load_failure(scratch: &Path, message: String) -> ScanError {
    if !file_exists(&scratch.join("go.mod")) {
        ScanError::LoadNoGoMod(message)
    } else if !file_exists(&scratch.join("go.sum")) {
        ScanError::LoadNoGoSum(message)
    } else if message.contains("no required module") {
        ScanError::LoadNoRequiredModule(message)
    } else if message.contains("missing go.sum entry") {
        ScanError::LoadMissingGoSumEntry(message)
    } else {
        ScanError::LoadPackages(message)
    }
}

/// True if the file exists or its existence cannot be ruled out. Only a
/// definite not-found counts as missing.
pub fn file_exists(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(_) => true,
        Err(err) => err.kind() != std::io::ErrorKind::NotFound,
    }
}

/// Renders a finished subprocess failure with its stderr folded in, so the
/// row's error message carries the analyzer's own diagnostics.
pub fn include_stderr(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("{}", output.status)
    } else {
        format!("{}: {stderr}", output.status)
    }
}

/// Operator-visible HTTP error. Scan failures never surface here; they are
/// recorded on rows. This type covers request parsing and infrastructure
/// failures only.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

// Convert from various error types
impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::InvalidArgument(msg) => Self::bad_request(msg),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

// Scratch-directory and staging failures have no classification of their
// own; they surface as analyzer errors.
impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Vulncheck(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ScanError::MemoryLimitExceeded.code(), "MEMORY_LIMIT_EXCEEDED");
        assert_eq!(ScanError::Proxy(String::new()).code(), "PROXY_ERROR");
        assert_eq!(ScanError::Analytics(String::new()).code(), "ANALYTICS_ERROR");
        assert_eq!(ScanError::SandboxLaunch(String::new()).code(), "SANDBOX_LAUNCH");
    }

    #[test]
    fn vulndb_heuristic_needs_both_substrings() {
        let host = "https://vuln.example.dev";
        assert!(is_vulndb_connection(
            "Get \"https://vuln.example.dev/index\": connection refused",
            host
        ));
        assert!(!is_vulndb_connection("connection refused", host));
        assert!(!is_vulndb_connection("https://vuln.example.dev: 404", host));
    }

    #[test]
    fn load_classification_order() {
        let dir = tempfile::tempdir().unwrap();
        let msg = || "load failed".to_string();

        let err = classify_load_failure(dir.path(), msg());
        assert_eq!(err.code(), "LOAD_NO_GO_MOD");

        std::fs::write(dir.path().join("go.mod"), "module m\n").unwrap();
        let err = classify_load_failure(dir.path(), msg());
        assert_eq!(err.code(), "LOAD_NO_GO_SUM");

        std::fs::write(dir.path().join("go.sum"), "").unwrap();
        let err = classify_load_failure(dir.path(), "x: no required module".to_string());
        assert_eq!(err.code(), "LOAD_NO_REQUIRED_MODULE");
        let err = classify_load_failure(dir.path(), "x: missing go.sum entry for y".to_string());
        assert_eq!(err.code(), "LOAD_MISSING_GO_SUM_ENTRY");
        let err = classify_load_failure(dir.path(), msg());
        assert_eq!(err.code(), "LOAD_PACKAGES");
    }

    #[test]
    fn scan_errors_map_to_http_status() {
        let err: AppError = ScanError::InvalidArgument("bad mode".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err: AppError = ScanError::Vulncheck("boom".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
