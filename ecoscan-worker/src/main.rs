//! Worker entry point: configuration, port wiring, HTTP serving.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ecoscan_config::Config;
use ecoscan_model::WorkVersion;
use ecoscan_worker::analytics::{NdjsonResultStore, ResultStore, SCHEMA_VERSION};
use ecoscan_worker::proxy::{HttpModuleProxy, ModuleProxy};
use ecoscan_worker::queue::{HttpDispatchQueue, TaskQueue};
use ecoscan_worker::routes::create_app;
use ecoscan_worker::sandbox::{Sandbox, SandboxRunner};
use ecoscan_worker::scan::host::{CacheCleaner, CacheReaper, ScanHost};
use ecoscan_worker::scan::memory::process_sampler;
use ecoscan_worker::state::AppState;
use ecoscan_worker::storage::{FsObjectStore, ObjectStore};
use ecoscan_worker::vulndb::{HttpVulnDb, VulnDb};

/// Command line arguments for the ecoscan worker
#[derive(Parser, Debug)]
#[command(name = "ecoscan-worker")]
#[command(about = "Vulnerability scanning worker for the module ecosystem")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(host) = args.host {
        config.server_host = host;
    }
    let config = Arc::new(config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        namespace = %config.namespace,
        insecure = config.insecure,
        mem_limit = config.mem_limit,
        workers = config.workers,
        managed_host = ecoscan_config::on_managed_host(),
        "worker configuration loaded"
    );
    config.ensure_directories()?;

    // In sandbox mode the dependency pre-warm writes into the bundle's
    // module cache; insecure scans inherit the host environment.
    let mod_cache = (!config.insecure).then(|| config.bundle_mod_cache());
    let proxy: Arc<dyn ModuleProxy> =
        Arc::new(HttpModuleProxy::new(config.proxy_url.clone(), mod_cache));

    let vulndb = HttpVulnDb::new(config.vulndb_url.clone());
    let vulndb_host = vulndb.host().to_string();
    let vulndb_last_modified = match vulndb.last_modified().await {
        Ok(stamp) => stamp,
        Err(err) => {
            warn!(%err, "vulnerability database unreachable; work version carries no stamp");
            None
        }
    };
    let work_version = WorkVersion {
        analyzer_version: config.analyzer_version.clone(),
        vulndb_last_modified,
        schema_version: SCHEMA_VERSION.to_string(),
    };
    info!(?work_version, "current work version");

    let store: Option<Arc<dyn ResultStore>> = match &config.results_path {
        Some(path) => {
            info!(path = %path.display(), "recording results");
            Some(Arc::new(NdjsonResultStore::new(path.clone())))
        }
        None => {
            warn!("no results path configured; analytics disabled");
            None
        }
    };

    let blobs: Option<Arc<dyn ObjectStore>> = config
        .binary_bucket
        .as_ref()
        .map(|root| Arc::new(FsObjectStore::new(root.clone())) as Arc<dyn ObjectStore>);
    if blobs.is_none() {
        warn!("binary bucket not configured; BINARY scans disabled");
    }

    let sandbox: Arc<dyn SandboxRunner> = Arc::new(Sandbox::new(
        config.bundle_dir.clone(),
        config.sandbox_runtime.clone(),
    ));

    let reaper: Arc<dyn CacheCleaner> = Arc::new(CacheReaper::new(
        Arc::clone(&sandbox),
        config.sandbox_analyzer.clone(),
        config.bundle_dir.clone(),
        config.insecure,
        ecoscan_config::on_managed_host(),
    ));
    let host = ScanHost::new(Some(reaper));

    let queue: Arc<dyn TaskQueue> = Arc::new(HttpDispatchQueue::new());

    let state = AppState {
        config: config.clone(),
        proxy,
        store,
        blobs,
        sandbox,
        queue,
        population: None,
        host,
        work_version,
        vulndb_host,
        sampler: process_sampler(),
    };

    let app = create_app(state);
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .with_context(|| {
            format!(
                "bad listen address {}:{}",
                config.server_host, config.server_port
            )
        })?;
    info!("starting ecoscan worker on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
