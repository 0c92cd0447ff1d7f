//! Shared application state for the worker's HTTP surface.

use std::collections::HashSet;
use std::sync::Arc;

use ecoscan_config::Config;
use ecoscan_model::WorkVersion;

use crate::analytics::ResultStore;
use crate::proxy::ModuleProxy;
use crate::queue::planner::ModulePopulation;
use crate::queue::TaskQueue;
use crate::sandbox::SandboxRunner;
use crate::scan::host::ScanHost;
use crate::scan::memory::MemSampler;
use crate::scan::scanner::{Scanner, ScannerOptions};
use crate::storage::ObjectStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub proxy: Arc<dyn ModuleProxy>,
    pub store: Option<Arc<dyn ResultStore>>,
    pub blobs: Option<Arc<dyn ObjectStore>>,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub queue: Arc<dyn TaskQueue>,
    pub population: Option<Arc<dyn ModulePopulation>>,
    pub host: Arc<ScanHost>,
    /// The current analytical generation, computed once at startup.
    pub work_version: WorkVersion,
    /// Database host as reported by the vulndb port; feeds the
    /// connection-failure heuristic.
    pub vulndb_host: String,
    pub sampler: MemSampler,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("work_version", &self.work_version)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds a scanner for one request. `insecure` is the effective value
    /// after any per-request override.
    pub fn scanner(&self, insecure: bool) -> Scanner {
        Scanner::new(
            ScannerOptions {
                work_version: self.work_version.clone(),
                vulndb_host: self.vulndb_host.clone(),
                mem_limit: self.config.mem_limit,
                insecure,
                workers: self.config.workers,
                skip_modules: self
                    .config
                    .skip_modules
                    .iter()
                    .cloned()
                    .collect::<HashSet<_>>(),
                bundle_dir: self.config.bundle_dir.clone(),
                sandbox_analyzer: self.config.sandbox_analyzer.clone(),
                host_analyzer: self.config.host_analyzer.clone(),
            },
            Arc::clone(&self.proxy),
            self.store.clone(),
            self.blobs.clone(),
            Arc::clone(&self.sandbox),
            Arc::clone(&self.host),
            Arc::clone(&self.sampler),
        )
    }
}
