//! Task queue: descriptors, deduplication, and dispatch.

pub mod planner;
pub mod taskid;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use ecoscan_model::ScanRequest;
use thiserror::Error;
use tracing::{debug, info};

pub use taskid::new_task_id;

/// Dispatch deadline stamped on every task; the queue terminates scans that
/// outlive it.
pub const MAX_DISPATCH_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Per-enqueue options.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Queue namespace; the first segment of task URLs.
    pub namespace: String,
    /// Appended to task IDs so the same module set can be re-enqueued.
    pub task_name_suffix: Option<String>,
    /// Ask workers not to trigger proxy fetches for uncached modules.
    pub disable_proxy_fetch: bool,
}

/// One enqueued unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Deduplication key, from [`taskid::new_task_id`].
    pub id: String,
    /// Worker URL the queue will POST to.
    pub url: String,
    pub dispatch_deadline: Duration,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue dispatch: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("queue rejected task {id}: status {status}")]
    Rejected { id: String, status: u16 },
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues one task. Returns false when the queue already holds a task
    /// with the same ID.
    async fn enqueue(&self, task: &Task) -> Result<bool, QueueError>;
}

/// Builds the task for one scan request.
pub fn new_task(queue_url: &str, sreq: &ScanRequest, opts: &QueueOptions) -> Task {
    let mut id = new_task_id(&sreq.coordinate.module, &sreq.coordinate.version);
    if let Some(suffix) = opts.task_name_suffix.as_deref().filter(|s| !s.is_empty()) {
        id.push('-');
        id.push_str(suffix);
    }
    let mut url = format!(
        "{}/{}/scan/{}",
        queue_url.trim_end_matches('/'),
        opts.namespace,
        sreq.url_path_and_params()
    );
    if opts.disable_proxy_fetch {
        // Historical URL shape; consumers parse it as-is.
        url.push_str("?proxyfetch=off");
    }
    Task {
        id,
        url,
        dispatch_deadline: MAX_DISPATCH_DEADLINE,
    }
}

/// Enqueues a batch of scan requests, dropping duplicates by task ID.
/// Returns the number of tasks the queue accepted.
pub async fn enqueue_scans(
    queue: &dyn TaskQueue,
    queue_url: &str,
    requests: &[ScanRequest],
    opts: &QueueOptions,
) -> Result<usize, QueueError> {
    let mut seen = HashSet::new();
    let mut enqueued = 0;
    for sreq in requests {
        let task = new_task(queue_url, sreq, opts);
        if !seen.insert(task.id.clone()) {
            debug!(id = %task.id, "dropping duplicate task");
            continue;
        }
        if queue.enqueue(&task).await? {
            enqueued += 1;
        }
    }
    info!(total = requests.len(), enqueued, "enqueue complete");
    Ok(enqueued)
}

/// Queue that dispatches tasks by POSTing their URL directly. Stands in for
/// a managed task queue in single-worker deployments; the worker's own
/// endpoint does the rest.
pub struct HttpDispatchQueue {
    http: reqwest::Client,
}

impl HttpDispatchQueue {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for HttpDispatchQueue {
    async fn enqueue(&self, task: &Task) -> Result<bool, QueueError> {
        let resp = self
            .http
            .post(&task.url)
            .timeout(task.dispatch_deadline)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        // Duplicate task names are not an error; the work already ran.
        if status.as_u16() == 409 {
            return Ok(false);
        }
        Err(QueueError::Rejected {
            id: task.id.clone(),
            status: status.as_u16(),
        })
    }
}
