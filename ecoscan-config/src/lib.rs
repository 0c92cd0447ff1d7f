//! Worker configuration, loaded from the environment.

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

/// Default minimum imported-by count for enqueue planning.
pub const DEFAULT_MIN_IMPORTED_BY: i64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    /// Queue namespace prepended to task URLs.
    pub namespace: String,

    /// Base URL that enqueued task URLs point at. Falls back to the
    /// environment-derived worker URL when unset.
    pub queue_url: Option<String>,

    /// Module proxy base URL.
    pub proxy_url: String,

    /// Vulnerability database base URL. Also feeds the connection-failure
    /// heuristic, so it must match the host the analyzer talks to.
    pub vulndb_url: String,

    /// Root of the blob store holding uploaded analysis binaries.
    pub binary_bucket: Option<PathBuf>,

    /// Root of the sandbox bundle.
    pub bundle_dir: PathBuf,

    /// Isolation runtime executable.
    pub sandbox_runtime: PathBuf,

    /// Analyzer path as seen from inside the sandbox bundle.
    pub sandbox_analyzer: String,

    /// Analyzer executable on the host, for insecure scans.
    pub host_analyzer: PathBuf,

    /// Default sandbox bypass; per-request `insecure` can override it.
    pub insecure: bool,

    /// Memory budget per scan in bytes; 0 means unlimited.
    pub mem_limit: u64,

    /// Configured request concurrency, for the row's `workers` column.
    pub workers: i64,

    /// Modules excluded from scanning.
    pub skip_modules: Vec<String>,

    /// NDJSON results file; analytics disabled when unset.
    pub results_path: Option<PathBuf>,

    /// Module population file used when an enqueue request names none.
    pub population_file: Option<PathBuf>,

    /// Revision stamp of the analyzer, part of the work version.
    pub analyzer_version: String,

    pub user: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenv::dotenv().ok();

        let user = env::var("USER").ok().filter(|u| !u.is_empty());
        let worker_url_suffix = env::var("GO_ECOSYSTEM_WORKER_URL_SUFFIX").ok();

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),

            namespace: env::var("ECOSCAN_NAMESPACE").unwrap_or_else(|_| "vulncheck".to_string()),

            queue_url: env::var("ECOSCAN_QUEUE_URL").ok().or_else(|| {
                worker_url_suffix.map(|suffix| format!("https://{suffix}"))
            }),

            proxy_url: env::var("ECOSCAN_PROXY_URL")
                .unwrap_or_else(|_| "https://proxy.golang.org".to_string()),
            vulndb_url: env::var("ECOSCAN_VULNDB_URL")
                .unwrap_or_else(|_| "https://vuln.go.dev".to_string()),

            binary_bucket: env::var("GO_ECOSYSTEM_BINARY_BUCKET").ok().map(PathBuf::from),

            bundle_dir: env::var("ECOSCAN_BUNDLE_DIR")
                .unwrap_or_else(|_| "/bundle".to_string())
                .into(),
            sandbox_runtime: env::var("ECOSCAN_SANDBOX_RUNTIME")
                .unwrap_or_else(|_| "/usr/local/bin/runsc".to_string())
                .into(),
            sandbox_analyzer: env::var("ECOSCAN_SANDBOX_ANALYZER")
                .unwrap_or_else(|_| "/binaries/vulncheck_sandbox".to_string()),
            host_analyzer: env::var("ECOSCAN_HOST_ANALYZER")
                .unwrap_or_else(|_| "vulncheck_sandbox".to_string())
                .into(),

            insecure: env::var("ECOSCAN_INSECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            mem_limit: parse_mem_limit(&env::var("GOMEMLIMIT").unwrap_or_default()),
            workers: get_env_int("CLOUD_RUN_CONCURRENCY", -1),

            skip_modules: env::var("ECOSCAN_SKIP_MODULES")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),

            results_path: env::var("ECOSCAN_RESULTS_PATH").ok().map(PathBuf::from).or_else(|| {
                // Developer runs get a per-user scratch file instead of the
                // fleet's analytics table.
                user.as_deref()
                    .filter(|_| !on_managed_host())
                    .map(|u| PathBuf::from(format!("/tmp/ecoscan-results-{u}.ndjson")))
            }),

            population_file: env::var("ECOSCAN_POPULATION_FILE").ok().map(PathBuf::from),

            analyzer_version: env::var("ECOSCAN_ANALYZER_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),

            user,
        })
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(results) = &self.results_path {
            if let Some(parent) = results.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Module cache directory under the bundle rootfs, as a host path.
    pub fn bundle_mod_cache(&self) -> PathBuf {
        self.bundle_dir.join("rootfs/go/pkg/mod")
    }
}

/// True when running on a managed cloud host, where destructive cache
/// reaping is permitted.
pub fn on_managed_host() -> bool {
    env::var("K_SERVICE").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Reads an integer environment variable, falling back on absence or parse
/// failure.
pub fn get_env_int(name: &str, fallback: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

/// Parses a GOMEMLIMIT-style value: a byte count with an optional `Ki`, `Mi`
/// or `Gi` suffix. Returns 0 (no limit) when unset, malformed, or shorter
/// than two characters.
pub fn parse_mem_limit(s: &str) -> u64 {
    if s.len() < 2 {
        return 0;
    }
    let (digits, multiplier) = match s.strip_suffix('i').and_then(|rest| {
        let unit = rest.as_bytes()[rest.len() - 1];
        let m: u64 = match unit {
            b'K' => 1 << 10,
            b'M' => 1 << 20,
            b'G' => 1 << 30,
            _ => return None,
        };
        Some((&rest[..rest.len() - 1], m))
    }) {
        Some(split) => split,
        None if s.ends_with('i') => return 0,
        None => (s, 1),
    };
    digits.parse::<u64>().map(|v| v.saturating_mul(multiplier)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mem_limit_accepts_suffixes() {
        assert_eq!(parse_mem_limit(""), 0);
        // Single-character values are rejected outright.
        assert_eq!(parse_mem_limit("2"), 0);
        assert_eq!(parse_mem_limit("42"), 42);
        assert_eq!(parse_mem_limit("2Ki"), 2 * 1024);
        assert_eq!(parse_mem_limit("3Mi"), 3 * 1024 * 1024);
        assert_eq!(parse_mem_limit("4Gi"), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_mem_limit_rejects_malformed() {
        assert_eq!(parse_mem_limit("4Ti"), 0);
        assert_eq!(parse_mem_limit("Mi"), 0);
        assert_eq!(parse_mem_limit("i"), 0);
        assert_eq!(parse_mem_limit("x12"), 0);
        assert_eq!(parse_mem_limit("-3Mi"), 0);
    }
}
