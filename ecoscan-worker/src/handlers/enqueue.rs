//! Enqueue endpoints: plan scan tasks and hand them to the queue.

use axum::{
    extract::{Query, State},
    http::StatusCode,
};
use ecoscan_config::DEFAULT_MIN_IMPORTED_BY;
use serde::Deserialize;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::queue::planner::{list_modes, plan_requests, EnqueueParams};
use crate::queue::{enqueue_scans, QueueOptions};
use crate::state::AppState;

/// Query parameters of `/vulncheck/enqueue` and `/vulncheck/enqueue-all`.
#[derive(Debug, Default, Deserialize)]
pub struct EnqueueQuery {
    pub suffix: Option<String>,
    pub mode: Option<String>,
    pub min: Option<i64>,
    pub file: Option<String>,
}

/// POST `/vulncheck/enqueue`: plan and enqueue one mode.
pub async fn handle_enqueue(
    State(state): State<AppState>,
    Query(query): Query<EnqueueQuery>,
) -> AppResult<StatusCode> {
    enqueue(state, query, false).await
}

/// POST `/vulncheck/enqueue-all`: plan and enqueue every known mode.
pub async fn handle_enqueue_all(
    State(state): State<AppState>,
    Query(query): Query<EnqueueQuery>,
) -> AppResult<StatusCode> {
    enqueue(state, query, true).await
}

async fn enqueue(state: AppState, query: EnqueueQuery, all_modes: bool) -> AppResult<StatusCode> {
    let queue_url = state
        .config
        .queue_url
        .clone()
        .ok_or_else(|| AppError::internal("queue URL not configured"))?;

    let params = EnqueueParams {
        suffix: query.suffix,
        mode: query.mode,
        min_imported_by: query.min.unwrap_or(DEFAULT_MIN_IMPORTED_BY),
        file: query.file.or_else(|| {
            state
                .config
                .population_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
        }),
    };
    let modes = list_modes(params.mode.as_deref(), all_modes)?;
    let requests = plan_requests(
        &params,
        &modes,
        state.population.as_deref(),
        state.blobs.as_deref(),
    )
    .await?;

    let opts = QueueOptions {
        namespace: state.config.namespace.clone(),
        task_name_suffix: params.suffix.clone(),
        disable_proxy_fetch: false,
    };
    let enqueued = enqueue_scans(&*state.queue, &queue_url, &requests, &opts)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    info!(modes = ?modes, planned = requests.len(), enqueued, "enqueue handled");
    Ok(StatusCode::OK)
}
