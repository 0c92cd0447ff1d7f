//! Vulnerability database port.
//!
//! The worker itself never queries vulnerabilities; the analyzer does. It
//! only needs the database's last-modified stamp (part of the work version)
//! and its host (fed to the connection-failure heuristic).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VulnDbError {
    #[error("vulndb request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vulndb returned {0}")]
    Status(u16),
}

#[async_trait]
pub trait VulnDb: Send + Sync {
    /// Base URL of the database, as the analyzer sees it.
    fn host(&self) -> &str;

    /// Last-modified stamp of the database snapshot.
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>, VulnDbError>;
}

#[derive(Debug, Deserialize)]
struct DbIndex {
    modified: Option<DateTime<Utc>>,
}

pub struct HttpVulnDb {
    base: String,
    http: reqwest::Client,
}

impl HttpVulnDb {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VulnDb for HttpVulnDb {
    fn host(&self) -> &str {
        &self.base
    }

    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>, VulnDbError> {
        let url = format!("{}/index/db.json", self.base);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(VulnDbError::Status(resp.status().as_u16()));
        }
        let index: DbIndex = resp.json().await?;
        Ok(index.modified)
    }
}
