//! Process-wide scan state: the active-scan counter, the stored
//! work-version snapshot, and the cache reaper hanging off the counter's
//! zero crossing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ecoscan_model::WorkVersion;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::analytics::{AnalyticsError, ModuleKey, ResultStore};
use crate::errors::include_stderr;
use crate::sandbox::SandboxRunner;
use crate::scan::analyzer::SANDBOX_MOD_CACHE;

/// Runs when the last active scan finishes. Module and build caches are
/// shared by every in-flight scan, so destruction is only safe at
/// quiescence.
#[async_trait]
pub trait CacheCleaner: Send + Sync {
    async fn clean(&self);
}

/// Owns the scan-global state. Tests instantiate isolated hosts; the worker
/// has exactly one in its application state.
pub struct ScanHost {
    active: AtomicI64,
    work_versions: OnceCell<Arc<HashMap<ModuleKey, WorkVersion>>>,
    cleaner: Option<Arc<dyn CacheCleaner>>,
}

impl ScanHost {
    pub fn new(cleaner: Option<Arc<dyn CacheCleaner>>) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicI64::new(0),
            work_versions: OnceCell::new(),
            cleaner,
        })
    }

    /// Registers an in-flight scan. The returned guard decrements the
    /// counter when dropped, on every exit path including unwinding; the
    /// decrement that reaches zero triggers the cleaner, and only that one.
    pub fn begin_scan(self: &Arc<Self>) -> ActiveScanGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveScanGuard {
            host: Arc::clone(self),
        }
    }

    pub fn active_scans(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// The stored work-version snapshot, loaded from the result store at
    /// most once per process. Without a store the snapshot is empty and
    /// everything gets scanned.
    pub async fn stored_work_versions(
        &self,
        store: Option<&dyn ResultStore>,
    ) -> Result<Arc<HashMap<ModuleKey, WorkVersion>>, AnalyticsError> {
        self.work_versions
            .get_or_try_init(|| async {
                match store {
                    None => Ok(Arc::new(HashMap::new())),
                    Some(store) => store.read_work_versions().await.map(Arc::new),
                }
            })
            .await
            .map(Arc::clone)
    }
}

pub struct ActiveScanGuard {
    host: Arc<ScanHost>,
}

impl Drop for ActiveScanGuard {
    fn drop(&mut self) {
        if self.host.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let Some(cleaner) = self.host.cleaner.clone() else {
            return;
        };
        // The guard can drop during unwinding; cleaning is async and must
        // not run on the unwinding stack.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { cleaner.clean().await });
        }
    }
}

/// The production cleaner. In sandbox mode it tells the analyzer to purge
/// the bundle's module and build caches; in insecure mode it runs the host
/// toolchain's clean, which is only permitted on managed hosts.
pub struct CacheReaper {
    sandbox: Arc<dyn SandboxRunner>,
    sandbox_analyzer: String,
    bundle_dir: PathBuf,
    insecure: bool,
    managed_host: bool,
}

impl CacheReaper {
    pub fn new(
        sandbox: Arc<dyn SandboxRunner>,
        sandbox_analyzer: impl Into<String>,
        bundle_dir: impl Into<PathBuf>,
        insecure: bool,
        managed_host: bool,
    ) -> Self {
        Self {
            sandbox,
            sandbox_analyzer: sandbox_analyzer.into(),
            bundle_dir: bundle_dir.into(),
            insecure,
            managed_host,
        }
    }

    async fn log_disk_usage(&self, when: &str) {
        let output = Command::new("du")
            .arg("-h")
            .arg("-s")
            .arg(self.bundle_dir.join("rootfs/modules"))
            .arg(self.bundle_dir.join("rootfs/go/pkg/mod"))
            .output()
            .await;
        match output {
            Ok(output) => debug!(
                usage = %String::from_utf8_lossy(&output.stdout).trim(),
                "bundle disk usage {when} clean"
            ),
            Err(err) => debug!(%err, "du failed"),
        }
    }
}

#[async_trait]
impl CacheCleaner for CacheReaper {
    async fn clean(&self) {
        if self.insecure {
            if !self.managed_host {
                // Never purge a developer's local caches.
                info!("not on a managed host, so not cleaning caches");
                return;
            }
            let output = Command::new("go")
                .args(["clean", "-cache", "-modcache"])
                .output()
                .await;
            match output {
                Ok(output) if output.status.success() => info!("cache clean succeeded"),
                Ok(output) => error!("cache clean failed: {}", include_stderr(&output)),
                Err(err) => error!(%err, "cache clean could not start"),
            }
            return;
        }

        self.log_disk_usage("before").await;
        match self
            .sandbox
            .run(
                &self.sandbox_analyzer,
                &["-gomodcache", SANDBOX_MOD_CACHE, "-clean"],
            )
            .await
        {
            Ok(output) => {
                if output.is_empty() {
                    info!("cache clean succeeded");
                } else {
                    info!(output = %String::from_utf8_lossy(&output).trim(), "cache clean succeeded");
                }
                self.log_disk_usage("after").await;
            }
            Err(err) => error!(%err, "cache clean failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingCleaner {
        cleans: AtomicI64,
    }

    #[async_trait]
    impl CacheCleaner for CountingCleaner {
        async fn clean(&self) {
            self.cleans.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn guard_restores_counter_on_panic() {
        let host = ScanHost::new(None);
        let inner = Arc::clone(&host);
        let task = tokio::spawn(async move {
            let _guard = inner.begin_scan();
            panic!("scan blew up");
        });
        assert!(task.await.is_err());
        assert_eq!(host.active_scans(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reaper_runs_once_after_concurrent_scans() {
        let cleaner = Arc::new(CountingCleaner::default());
        let host = ScanHost::new(Some(cleaner.clone()));

        let mut scans = Vec::new();
        for i in 0..3 {
            let host = Arc::clone(&host);
            scans.push(tokio::spawn(async move {
                let _guard = host.begin_scan();
                tokio::time::sleep(Duration::from_millis(30 + 20 * i)).await;
            }));
        }
        for scan in scans {
            scan.await.unwrap();
        }
        // The zero-crossing spawns the cleaner; give it a beat to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(host.active_scans(), 0);
        assert_eq!(cleaner.cleans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_clean_while_scans_in_flight() {
        let cleaner = Arc::new(CountingCleaner::default());
        let host = ScanHost::new(Some(cleaner.clone()));

        let outer = host.begin_scan();
        {
            let _inner = host.begin_scan();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cleaner.cleans.load(Ordering::SeqCst), 0);

        drop(outer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cleaner.cleans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn work_versions_load_once_and_default_empty() {
        let host = ScanHost::new(None);
        let first = host.stored_work_versions(None).await.unwrap();
        assert!(first.is_empty());
        let second = host.stored_work_versions(None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
