//! Scan endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::scan::request::{parse_scan_request, ScanQuery};
use crate::state::AppState;

/// POST `/vulncheck/scan/<module>/@v/<version>[/<suffix>]`.
///
/// Accepts and runs one scan. All result reporting is out-of-band through
/// the analytics store, so acceptance is a bare 200.
pub async fn handle_scan(
    State(state): State<AppState>,
    Path(module_path): Path<String>,
    Query(query): Query<ScanQuery>,
) -> AppResult<StatusCode> {
    let parsed = parse_scan_request(&module_path, &query)?;
    // An explicit, non-empty insecure param overrides the worker default.
    let insecure = parsed
        .insecure_override
        .unwrap_or(state.config.insecure);
    let scanner = state.scanner(insecure);
    scanner
        .scan_module(&parsed.request, parsed.disable_proxy_fetch)
        .await?;
    info!(path = %parsed.request.path(), "scan request finished");
    Ok(StatusCode::OK)
}

/// POST `/test-vulncheck-sandbox/<module>/@v/<version>`.
///
/// Diagnostic: runs a sandboxed source scan and returns the analyzer's JSON
/// instead of writing it to the analytics store.
pub async fn handle_test_sandbox(
    State(state): State<AppState>,
    Path(module_path): Path<String>,
    Query(query): Query<ScanQuery>,
) -> AppResult<Response> {
    let parsed = parse_scan_request(&module_path, &query)?;
    let scanner = state.scanner(false);
    let output = scanner
        .test_scan_source_sandbox(
            &parsed.request.coordinate.module,
            &parsed.request.coordinate.version,
        )
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        output,
    )
        .into_response())
}
