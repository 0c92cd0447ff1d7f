//! End-to-end tests of the worker's HTTP surface, with the external
//! capabilities faked at the port boundary.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use ecoscan_config::Config;
use ecoscan_model::WorkVersion;
use ecoscan_worker::analytics::{NdjsonResultStore, ResultStore, SCHEMA_VERSION};
use ecoscan_worker::proxy::{ModuleProxy, ProxyError, VersionInfo};
use ecoscan_worker::queue::{QueueError, Task, TaskQueue};
use ecoscan_worker::routes::create_app;
use ecoscan_worker::sandbox::{SandboxError, SandboxRunner};
use ecoscan_worker::scan::host::ScanHost;
use ecoscan_worker::state::AppState;

const VULN_JSON: &[u8] =
    br#"{"Vulns":[{"OSV":{"id":"GO-2022-0969"},"Symbol":"Read","PkgPath":"p","ModPath":"m"}]}"#;

struct StubProxy;

#[async_trait]
impl ModuleProxy for StubProxy {
    async fn info(
        &self,
        _module: &str,
        version: &str,
        _disable_fetch: bool,
    ) -> Result<VersionInfo, ProxyError> {
        Ok(VersionInfo {
            version: version.to_string(),
            time: Utc::now(),
        })
    }

    async fn download(
        &self,
        _module: &str,
        _version: &str,
        dest: &Path,
        _resolve_deps: bool,
    ) -> Result<(), ProxyError> {
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("go.mod"), "module m\n").await?;
        Ok(())
    }
}

struct StubSandbox;

#[async_trait]
impl SandboxRunner for StubSandbox {
    async fn run(&self, _program: &str, _args: &[&str]) -> Result<Vec<u8>, SandboxError> {
        Ok(VULN_JSON.to_vec())
    }
}

#[derive(Default)]
struct RecordingQueue {
    tasks: Mutex<Vec<Task>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: &Task) -> Result<bool, QueueError> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.iter().any(|t| t.id == task.id) {
            return Ok(false);
        }
        tasks.push(task.clone());
        Ok(true)
    }
}

struct Worker {
    addr: SocketAddr,
    queue: Arc<RecordingQueue>,
    store: Arc<NdjsonResultStore>,
    _scratch: tempfile::TempDir,
}

fn test_config(scratch: &Path) -> Config {
    Config {
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        namespace: "vulncheck".to_string(),
        queue_url: Some("http://1.2.3.4:8000".to_string()),
        proxy_url: "http://proxy.invalid".to_string(),
        vulndb_url: "https://vuln.test.dev".to_string(),
        binary_bucket: None,
        bundle_dir: scratch.join("bundle"),
        sandbox_runtime: "/usr/local/bin/runsc".into(),
        sandbox_analyzer: "/binaries/analyzer".to_string(),
        host_analyzer: "analyzer".into(),
        insecure: false,
        mem_limit: 0,
        workers: 2,
        skip_modules: Vec::new(),
        results_path: Some(scratch.join("results.ndjson")),
        population_file: None,
        analyzer_version: "test-analyzer".to_string(),
        user: None,
    }
}

async fn start_worker() -> Worker {
    let scratch = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(scratch.path()));
    let store = Arc::new(NdjsonResultStore::new(
        config.results_path.clone().unwrap(),
    ));
    let queue = Arc::new(RecordingQueue::default());

    let state = AppState {
        config,
        proxy: Arc::new(StubProxy),
        store: Some(store.clone() as Arc<dyn ResultStore>),
        blobs: None,
        sandbox: Arc::new(StubSandbox),
        queue: queue.clone() as Arc<dyn TaskQueue>,
        population: None,
        host: ScanHost::new(None),
        work_version: WorkVersion {
            analyzer_version: "test-analyzer".to_string(),
            vulndb_last_modified: None,
            schema_version: SCHEMA_VERSION.to_string(),
        },
        vulndb_host: "https://vuln.test.dev".to_string(),
        sampler: Arc::new(|| 0),
    };

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Worker {
        addr,
        queue,
        store,
        _scratch: scratch,
    }
}

#[tokio::test]
async fn health_endpoint_responds() {
    let worker = start_worker().await;
    let resp = reqwest::get(format!("http://{}/healthz", worker.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn scan_endpoint_records_row_and_returns_empty_200() {
    let worker = start_worker().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/vulncheck/scan/m/@v/v1.2.3?importedby=42&mode=vta",
            worker.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());

    let versions = worker.store.read_work_versions().await.unwrap();
    assert_eq!(
        versions
            .get(&("m".to_string(), "v1.2.3".to_string()))
            .map(|wv| wv.analyzer_version.as_str()),
        Some("test-analyzer")
    );
}

#[tokio::test]
async fn scan_endpoint_rejects_unknown_mode() {
    let worker = start_worker().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/vulncheck/scan/m/@v/v1.2.3?mode=NOPE",
            worker.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn scanning_std_is_accepted_but_unrecorded() {
    let worker = start_worker().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/vulncheck/scan/std/@v/v1.21.0",
            worker.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(worker.store.read_work_versions().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_plans_tasks_from_population_file() {
    let worker = start_worker().await;

    let mut population = tempfile::NamedTempFile::new().unwrap();
    writeln!(population, "golang.org/x/text v0.3.8 120").unwrap();
    writeln!(population, "example.com/tiny v1.0.0 1").unwrap();
    writeln!(population, "std v1.21.0 9999").unwrap();
    population.flush().unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/vulncheck/enqueue?min=10&file={}",
            worker.addr,
            population.path().display()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let tasks = worker.queue.tasks.lock().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        tasks[0].url,
        "http://1.2.3.4:8000/vulncheck/scan/golang.org/x/text/@v/v0.3.8?importedby=120&mode=VTA&insecure=false"
    );
}

#[tokio::test]
async fn enqueue_all_rejects_explicit_mode() {
    let worker = start_worker().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/vulncheck/enqueue-all?mode=VTA",
            worker.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_sandbox_endpoint_returns_analyzer_json() {
    let worker = start_worker().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/test-vulncheck-sandbox/m/@v/v1.2.3",
            worker.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: HashMap<String, serde_json::Value> = resp.json().await.unwrap();
    assert!(body.contains_key("Vulns"));
}
