//! The per-request scan state machine.
//!
//! A request flows fetch → dedup → scan → record. Every failure past
//! request parsing is recovered, classified, and recorded on the result row;
//! nothing a scan does may crash the worker.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use ecoscan_model::{for_sorting, ScanMode, ScanRecord, ScanRequest, VulnFinding, WorkVersion};

use crate::analytics::ResultStore;
use crate::errors::{
    classify_load_failure, file_exists, include_stderr, is_vulndb_connection, ScanError,
};
use crate::proxy::{ModuleProxy, ProxyError};
use crate::queue::planner::BINARY_PREFIX;
use crate::sandbox::{SandboxError, SandboxRunner};
use crate::scan::analyzer::{self, AnalyzerOutputError, AnalyzerReport, SANDBOX_MOD_CACHE};
use crate::scan::host::ScanHost;
use crate::scan::memory::{log_host_memory, mem_delta, run_with_monitor, MemSampler};
use crate::storage::ObjectStore;

/// Static scanner configuration, split off so tests can build scanners
/// around fake ports without a full worker config.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub work_version: WorkVersion,
    pub vulndb_host: String,
    /// Memory budget in bytes; 0 disables the monitor's cancellation.
    pub mem_limit: u64,
    /// Run the analyzer directly on the host instead of in the sandbox.
    pub insecure: bool,
    /// Value for the row's `workers` column.
    pub workers: i64,
    /// Deny list of modules that are never scanned.
    pub skip_modules: HashSet<String>,
    pub bundle_dir: PathBuf,
    /// Analyzer path as seen from inside the sandbox.
    pub sandbox_analyzer: String,
    /// Analyzer executable for insecure scans.
    pub host_analyzer: PathBuf,
}

/// Timing and memory measurements of one analyzer run.
#[derive(Debug, Default)]
struct ScanStats {
    scan_seconds: f64,
    scan_memory: u64,
    pkgs_memory: u64,
}

pub struct Scanner {
    opts: ScannerOptions,
    proxy: Arc<dyn ModuleProxy>,
    store: Option<Arc<dyn ResultStore>>,
    blobs: Option<Arc<dyn ObjectStore>>,
    sandbox: Arc<dyn SandboxRunner>,
    host: Arc<ScanHost>,
    sampler: MemSampler,
}

impl Scanner {
    pub fn new(
        opts: ScannerOptions,
        proxy: Arc<dyn ModuleProxy>,
        store: Option<Arc<dyn ResultStore>>,
        blobs: Option<Arc<dyn ObjectStore>>,
        sandbox: Arc<dyn SandboxRunner>,
        host: Arc<ScanHost>,
        sampler: MemSampler,
    ) -> Self {
        Self {
            opts,
            proxy,
            store,
            blobs,
            sandbox,
            host,
            sampler,
        }
    }

    /// Executes one scan request end to end and returns the emitted row,
    /// or `None` when the request was skipped (standard library, deny list,
    /// unchanged work version).
    ///
    /// `Err` is reserved for infrastructure failures before the scan proper
    /// begins; scan failures are recorded on the row instead.
    pub async fn scan_module(
        &self,
        sreq: &ScanRequest,
        disable_proxy_fetch: bool,
    ) -> Result<Option<ScanRecord>, ScanError> {
        let module = &sreq.coordinate.module;
        let requested_version = &sreq.coordinate.version;
        if module == "std" {
            // The standard library is filtered upstream; never a row.
            return Ok(None);
        }
        if self.opts.skip_modules.contains(module.as_str()) {
            info!(%module, "skipping (module in deny list)");
            return Ok(None);
        }

        let stored = self
            .host
            .stored_work_versions(self.store.as_deref())
            .await
            .map_err(|err| ScanError::Analytics(format!("reading stored work versions: {err}")))?;
        if stored.get(&(module.clone(), requested_version.clone())) == Some(&self.opts.work_version)
        {
            info!(%module, version = %requested_version, "skipping (work version unchanged)");
            return Ok(None);
        }

        let mut row = ScanRecord {
            module_path: module.clone(),
            suffix: sreq.coordinate.suffix.clone(),
            work_version: self.opts.work_version.clone(),
            ..Default::default()
        };

        info!(%module, version = %requested_version, "fetching proxy info");
        let info = match self
            .proxy
            .info(module, requested_version, disable_proxy_fetch)
            .await
        {
            Ok(info) => info,
            Err(err) => {
                error!(%module, version = %requested_version, %err, "proxy error");
                let err = ScanError::Proxy(err.to_string());
                row.add_error(err.code(), err.to_string());
                self.record(&mut row).await;
                return Ok(Some(row));
            }
        };
        row.version = info.version.clone();
        row.sort_version = for_sorting(&row.version);
        row.commit_time = Some(info.time);
        row.imported_by = sreq.params.imported_by;
        row.vulndb_last_modified = self.opts.work_version.vulndb_last_modified;
        row.scan_mode = sreq.params.mode.clone();

        info!(path = %sreq.path(), "scanning");
        log_host_memory(&format!("before scanning {module}@{}", row.version));

        let mut stats = ScanStats::default();
        let outcome = {
            let _active = self.host.begin_scan();
            AssertUnwindSafe(self.run_scan(
                module,
                &info.version,
                &sreq.coordinate.suffix,
                &sreq.params.mode,
                &mut stats,
            ))
            .catch_unwind()
            .await
        };
        log_host_memory(&format!("after scanning {module}@{}", row.version));

        row.scan_seconds = stats.scan_seconds;
        row.scan_memory = stats.scan_memory as i64;
        row.pkgs_memory = stats.pkgs_memory as i64;
        row.workers = self.opts.workers;

        match outcome {
            Ok(Ok(vulns)) => {
                info!(path = %sreq.path(), vulns = vulns.len(), "scan completed");
                row.vulns = vulns;
            }
            Ok(Err(err)) => {
                info!(path = %sreq.path(), %err, "scan failed");
                row.add_error(err.code(), err.to_string());
            }
            Err(panic) => {
                let err = ScanError::Panic(panic_message(panic));
                error!(path = %sreq.path(), %err, "scan panicked");
                row.add_error(err.code(), err.to_string());
            }
        }

        self.record(&mut row).await;
        Ok(Some(row))
    }

    /// Diagnostic path: run a VTA source scan in the sandbox and return the
    /// analyzer's raw JSON instead of recording it.
    pub async fn test_scan_source_sandbox(
        &self,
        module: &str,
        version: &str,
    ) -> Result<Vec<u8>, ScanError> {
        let (sandbox_path, _scratch) = self.fetch_source_into_bundle(module, version).await?;
        let args = [
            "-gomodcache",
            SANDBOX_MOD_CACHE,
            ScanMode::Vta.as_str(),
            sandbox_path.as_str(),
        ];
        self.sandbox
            .run(&self.opts.sandbox_analyzer, &args)
            .await
            .map_err(map_sandbox_error)
    }

    async fn record(&self, row: &mut ScanRecord) {
        let Some(store) = &self.store else {
            info!("analytics disabled, not uploading");
            return;
        };
        info!(module = %row.module_path, version = %row.version, "appending result row");
        if let Err(err) = store.upsert(row).await {
            // Terminal for this row; the append is not retried.
            let err = ScanError::Analytics(err.to_string());
            row.add_error(err.code(), err.to_string());
            error!(module = %row.module_path, version = %row.version, %err, "analytics append failed");
            debug!(?row, "row retained for forensics");
        }
    }

    async fn run_scan(
        &self,
        module: &str,
        version: &str,
        suffix: &str,
        mode: &str,
        stats: &mut ScanStats,
    ) -> Result<Vec<VulnFinding>, ScanError> {
        let result = if self.opts.insecure {
            self.run_scan_insecure(module, version, suffix, mode, stats).await
        } else {
            self.run_scan_sandbox(module, version, suffix, mode, stats).await
        };
        match result {
            Ok(report) => Ok(report.vulns.into_iter().map(Into::into).collect()),
            Err(err) => Err(self.classify_transport(err)),
        }
    }

    /// Rewrites analyzer-side failures that are really vulnerability-database
    /// connectivity problems.
    fn classify_transport(&self, err: ScanError) -> ScanError {
        let host = &self.opts.vulndb_host;
        match err {
            ScanError::Vulncheck(msg) if is_vulndb_connection(&msg, host) => {
                ScanError::VulnDbConnection(msg)
            }
            ScanError::SandboxExit(msg) if is_vulndb_connection(&msg, host) => {
                ScanError::VulnDbConnection(msg)
            }
            ScanError::LoadPackages(msg) if is_vulndb_connection(&msg, host) => {
                ScanError::VulnDbConnection(msg)
            }
            other => other,
        }
    }

    async fn run_scan_sandbox(
        &self,
        module: &str,
        version: &str,
        suffix: &str,
        mode: &str,
        stats: &mut ScanStats,
    ) -> Result<AnalyzerReport, ScanError> {
        if mode == ScanMode::Binary.as_str() {
            self.run_binary_scan_sandbox(module, version, suffix, stats).await
        } else {
            self.run_source_scan_sandbox(module, version, mode, stats).await
        }
    }

    async fn run_source_scan_sandbox(
        &self,
        module: &str,
        version: &str,
        mode: &str,
        stats: &mut ScanStats,
    ) -> Result<AnalyzerReport, ScanError> {
        let pre_fetch = (self.sampler)();
        let (sandbox_path, _scratch) = self.fetch_source_into_bundle(module, version).await?;
        stats.pkgs_memory = mem_delta((self.sampler)(), pre_fetch);

        info!(module, version, "running analyzer in sandbox");
        let args = ["-gomodcache", SANDBOX_MOD_CACHE, mode, sandbox_path.as_str()];
        let stdout = self.run_sandbox_monitored(&args, stats).await?;
        parse_sandbox_report(&stdout)
    }

    /// Materializes the module source under the bundle rootfs and resolves
    /// its dependency graph so the sandboxed analyzer can run offline.
    /// Returns the module path as seen from inside the sandbox, plus a guard
    /// that removes the tree when the scan is done.
    async fn fetch_source_into_bundle(
        &self,
        module: &str,
        version: &str,
    ) -> Result<(String, RemoveOnDrop), ScanError> {
        let sandbox_path = format!("/modules/{module}@{version}");
        let image_dir = self.opts.bundle_dir.join("rootfs").join(&sandbox_path[1..]);
        info!(module, version, dir = %image_dir.display(), "downloading module into bundle");
        let scratch = RemoveOnDrop(image_dir.clone());
        self.proxy
            .download(module, version, &image_dir, true)
            .await
            .map_err(map_proxy_error)?;
        Ok((sandbox_path, scratch))
    }

    async fn run_binary_scan_sandbox(
        &self,
        module: &str,
        version: &str,
        suffix: &str,
        stats: &mut ScanStats,
    ) -> Result<AnalyzerReport, ScanError> {
        let blobs = self.blobs.as_ref().ok_or_else(|| {
            ScanError::Vulncheck(
                "binary bucket not configured; set GO_ECOSYSTEM_BINARY_BUCKET".to_string(),
            )
        })?;
        // The analyzer needs random access; blob readers are stream-only.
        // Stage a local copy under the bundle for the scan's lifetime.
        let object = format!("{BINARY_PREFIX}{module}@{version}/{suffix}");
        let staging = self.opts.bundle_dir.join("rootfs/binaries");
        tokio::fs::create_dir_all(&staging).await?;
        let local = tempfile::Builder::new()
            .prefix("analysis-binary-")
            .tempfile_in(&staging)?;
        debug!(module, version, suffix, object, dest = %local.path().display(), "copying binary");
        blobs
            .fetch(&object, local.path())
            .await
            .map_err(|err| ScanError::Vulncheck(err.to_string()))?;
        let file_name = local
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| ScanError::Vulncheck("staged binary has no file name".to_string()))?;

        info!(module, version, suffix, "running binary analysis in sandbox");
        let sandbox_path = format!("/binaries/{file_name}");
        let args = [ScanMode::Binary.as_str(), sandbox_path.as_str()];
        let stdout = self.run_sandbox_monitored(&args, stats).await?;
        parse_sandbox_report(&stdout)
    }

    async fn run_sandbox_monitored(
        &self,
        args: &[&str],
        stats: &mut ScanStats,
    ) -> Result<Vec<u8>, ScanError> {
        let pre_scan = (self.sampler)();
        let start = Instant::now();
        let run = self.sandbox.run(&self.opts.sandbox_analyzer, args);
        let monitored =
            run_with_monitor(self.opts.mem_limit, Arc::clone(&self.sampler), run).await;
        // Timing and peak memory are wanted even when the run failed.
        stats.scan_seconds = start.elapsed().as_secs_f64();
        stats.scan_memory = mem_delta(monitored.peak, pre_scan);
        match monitored.result {
            None => Err(ScanError::MemoryLimitExceeded),
            Some(Err(err)) => Err(map_sandbox_error(err)),
            Some(Ok(stdout)) => Ok(stdout),
        }
    }

    async fn run_scan_insecure(
        &self,
        module: &str,
        version: &str,
        suffix: &str,
        mode: &str,
        stats: &mut ScanStats,
    ) -> Result<AnalyzerReport, ScanError> {
        let scratch = tempfile::tempdir()?;
        if mode == ScanMode::Binary.as_str() {
            let blobs = self.blobs.as_ref().ok_or_else(|| {
                ScanError::Vulncheck(
                    "binary bucket not configured; set GO_ECOSYSTEM_BINARY_BUCKET".to_string(),
                )
            })?;
            let object = format!("{BINARY_PREFIX}{module}@{version}/{suffix}");
            let local = scratch.path().join("binary");
            debug!(module, version, suffix, object, "copying binary to temp dir");
            blobs
                .fetch(&object, &local)
                .await
                .map_err(|err| ScanError::Vulncheck(err.to_string()))?;
            let local = local.to_string_lossy().into_owned();
            let stdout = self.run_host_monitored(&[mode, local.as_str()], stats).await?;
            return parse_sandbox_report(&stdout);
        }

        debug!(module, version, "fetching module source");
        let pre_fetch = (self.sampler)();
        self.proxy
            .download(module, version, scratch.path(), true)
            .await
            .map_err(map_proxy_error)?;
        stats.pkgs_memory = mem_delta((self.sampler)(), pre_fetch);

        let dir = scratch.path().to_string_lossy().into_owned();
        let stdout = self.run_host_monitored(&[mode, dir.as_str()], stats).await?;
        match analyzer::parse_output(&stdout) {
            Ok(report) => Ok(report),
            Err(AnalyzerOutputError::Malformed(err)) => Err(ScanError::Vulncheck(format!(
                "unmarshaling analyzer output: {err}"
            ))),
            Err(AnalyzerOutputError::Reported(msg)) => {
                Err(classify_insecure_source_failure(scratch.path(), msg))
            }
        }
    }

    async fn run_host_monitored(
        &self,
        args: &[&str],
        stats: &mut ScanStats,
    ) -> Result<Vec<u8>, ScanError> {
        let pre_scan = (self.sampler)();
        let start = Instant::now();
        let run = run_host_analyzer(&self.opts.host_analyzer, args);
        let monitored =
            run_with_monitor(self.opts.mem_limit, Arc::clone(&self.sampler), run).await;
        stats.scan_seconds = start.elapsed().as_secs_f64();
        stats.scan_memory = mem_delta(monitored.peak, pre_scan);
        match monitored.result {
            None => Err(ScanError::MemoryLimitExceeded),
            Some(result) => result,
        }
    }
}

async fn run_host_analyzer(program: &Path, args: &[&str]) -> Result<Vec<u8>, ScanError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| ScanError::Vulncheck(format!("starting analyzer: {err}")))?;
    if !output.status.success() {
        return Err(ScanError::Vulncheck(include_stderr(&output)));
    }
    Ok(output.stdout)
}

fn parse_sandbox_report(stdout: &[u8]) -> Result<AnalyzerReport, ScanError> {
    analyzer::parse_output(stdout).map_err(|err| match err {
        AnalyzerOutputError::Malformed(err) => {
            ScanError::Vulncheck(format!("unmarshaling analyzer output: {err}"))
        }
        AnalyzerOutputError::Reported(msg) => ScanError::Vulncheck(msg),
    })
}

/// Load failures only look like load failures outside the sandbox, where
/// the scratch tree is inspectable. Anything else stays an analyzer error.
fn classify_insecure_source_failure(scratch: &Path, message: String) -> ScanError {
    let load_shaped = !file_exists(&scratch.join("go.mod"))
        || !file_exists(&scratch.join("go.sum"))
        || message.contains("no required module")
        || message.contains("missing go.sum entry")
        || message.contains("loading packages");
    if load_shaped {
        classify_load_failure(scratch, message)
    } else {
        ScanError::Vulncheck(message)
    }
}

fn map_proxy_error(err: ProxyError) -> ScanError {
    match err {
        ProxyError::BadModule(msg) => ScanError::BadModule(msg),
        other => ScanError::Proxy(other.to_string()),
    }
}

fn map_sandbox_error(err: SandboxError) -> ScanError {
    match err {
        SandboxError::Launch(err) => ScanError::SandboxLaunch(err.to_string()),
        SandboxError::Exit(msg) => ScanError::SandboxExit(msg),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    };
    format!(
        "{message}\n\n{}",
        std::backtrace::Backtrace::force_capture()
    )
}

/// Best-effort scratch cleanup tied to scope exit.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
