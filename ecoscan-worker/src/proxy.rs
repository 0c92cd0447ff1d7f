//! Module proxy adapter: version metadata and source download.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::include_stderr;

/// Canonical version metadata served by the proxy's `.info` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("proxy returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("module archive: {0}")]
    Archive(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The module tree is structurally unusable; dependency resolution
    /// failed on it.
    #[error("bad module: {0}")]
    BadModule(String),
}

#[async_trait]
pub trait ModuleProxy: Send + Sync {
    /// Resolves the canonical version and commit time. `disable_fetch` asks
    /// the proxy not to fetch modules it has not already cached.
    async fn info(
        &self,
        module: &str,
        version: &str,
        disable_fetch: bool,
    ) -> Result<VersionInfo, ProxyError>;

    /// Downloads the module tree into `dest`. With `resolve_deps` the module
    /// graph is additionally resolved so a later sandboxed analysis does not
    /// reach out to the network.
    async fn download(
        &self,
        module: &str,
        version: &str,
        dest: &Path,
        resolve_deps: bool,
    ) -> Result<(), ProxyError>;
}

/// HTTP client against a module proxy.
pub struct HttpModuleProxy {
    base: String,
    http: reqwest::Client,
    /// Module cache the dependency pre-warm writes into; inherits the host
    /// environment when unset.
    mod_cache: Option<PathBuf>,
}

impl HttpModuleProxy {
    pub fn new(base: impl Into<String>, mod_cache: Option<PathBuf>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            mod_cache,
        }
    }

    fn endpoint(&self, module: &str, version: &str, kind: &str) -> String {
        format!(
            "{}/{}/@v/{}.{kind}",
            self.base,
            escape_module_path(module),
            version
        )
    }
}

#[async_trait]
impl ModuleProxy for HttpModuleProxy {
    async fn info(
        &self,
        module: &str,
        version: &str,
        disable_fetch: bool,
    ) -> Result<VersionInfo, ProxyError> {
        let url = self.endpoint(module, version, "info");
        let mut req = self.http.get(&url);
        if disable_fetch {
            req = req.header("Disable-Module-Fetch", "true");
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ProxyError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(resp.json().await?)
    }

    async fn download(
        &self,
        module: &str,
        version: &str,
        dest: &Path,
        resolve_deps: bool,
    ) -> Result<(), ProxyError> {
        let url = self.endpoint(module, version, "zip");
        debug!(module, version, url, "downloading module zip");
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ProxyError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?;

        let dest_owned = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_module_zip(&body, &dest_owned))
            .await
            .map_err(|err| ProxyError::Archive(format!("extraction task failed: {err}")))??;

        if resolve_deps {
            self.prewarm_module_cache(module, version, dest).await?;
        }
        Ok(())
    }
}

impl HttpModuleProxy {
    /// Resolves the module graph in `dir` so analysis can run offline,
    /// writing downloads into the configured module cache.
    async fn prewarm_module_cache(
        &self,
        module: &str,
        version: &str,
        dir: &Path,
    ) -> Result<(), ProxyError> {
        info!(module, version, "resolving module dependencies");
        let mut cmd = Command::new("go");
        cmd.arg("mod")
            .arg("download")
            .current_dir(dir)
            .env("GOPROXY", &self.base)
            .kill_on_drop(true);
        if let Some(cache) = &self.mod_cache {
            cmd.env("GOMODCACHE", cache);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ProxyError::BadModule(format!(
                "dependency download for {module}@{version} returned {}",
                include_stderr(&output)
            )));
        }
        Ok(())
    }
}

/// Unpacks a module zip. Entries are rooted at `module@version/`; that
/// single leading component is stripped so `dest` becomes the module root.
fn extract_module_zip(data: &[u8], dest: &Path) -> Result<(), ProxyError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|err| ProxyError::Archive(err.to_string()))?;
    std::fs::create_dir_all(dest)?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ProxyError::Archive(err.to_string()))?;
        let Some(name) = entry.enclosed_name() else {
            return Err(ProxyError::Archive(format!(
                "unsafe entry name {:?}",
                entry.name()
            )));
        };
        let stripped: PathBuf = name.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(stripped);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        std::fs::write(&target, contents)?;
    }
    Ok(())
}

/// Case-encodes a module path for proxy URLs: uppercase letters become
/// `!` followed by the lowercase letter.
pub fn escape_module_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
