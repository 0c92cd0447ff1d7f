//! Enqueue planner: expands (modes × module population) into scan requests.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use ecoscan_model::{ModuleUrlPath, ScanMode, ScanRequest, ScanRequestParams};
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::queue::taskid::new_task_id;
use crate::storage::{ObjectStore, StorageError};

/// Blob-store prefix that holds binaries awaiting BINARY scans.
pub const BINARY_PREFIX: &str = "binaries/";

/// Query parameters of the enqueue endpoints.
#[derive(Debug, Clone, Default)]
pub struct EnqueueParams {
    pub suffix: Option<String>,
    pub mode: Option<String>,
    pub min_imported_by: i64,
    pub file: Option<String>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("module population: {0}")]
    Population(String),
    #[error("listing binaries: {0}")]
    Storage(#[from] StorageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PlanError> for AppError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::InvalidArgument(msg) => AppError::bad_request(msg),
            other => AppError::internal(other.to_string()),
        }
    }
}

/// One module of the scan population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub module: String,
    pub version: String,
    pub imported_by: i64,
}

/// Source of the module population when no file is supplied.
#[async_trait]
pub trait ModulePopulation: Send + Sync {
    async fn modules(&self, min_imported_by: i64) -> Result<Vec<ModuleSpec>, PlanError>;
}

/// Resolves the mode list for an enqueue request: the single requested mode,
/// or every known mode. The all-modes list is sorted so planning output is
/// deterministic.
pub fn list_modes(mode: Option<&str>, all_modes: bool) -> Result<Vec<String>, PlanError> {
    if all_modes {
        if mode.is_some_and(|m| !m.is_empty()) {
            return Err(PlanError::InvalidArgument(
                "mode query param provided for enqueue-all".to_string(),
            ));
        }
        return Ok(ScanMode::ALL.iter().map(|m| m.as_str().to_string()).collect());
    }
    let mode = match mode.filter(|m| !m.is_empty()) {
        // VTA is the default mode
        None => return Ok(vec![ScanMode::Vta.as_str().to_string()]),
        Some(m) => m.to_ascii_uppercase(),
    };
    if !ScanMode::is_valid(&mode) {
        return Err(PlanError::InvalidArgument(format!("unsupported mode: {mode}")));
    }
    Ok(vec![mode])
}

/// Expands the request into concrete scan requests, one per
/// `(module, mode)`, deduplicated by task identifier. The standard library
/// is never scanned and is dropped here.
pub async fn plan_requests(
    params: &EnqueueParams,
    modes: &[String],
    population: Option<&dyn ModulePopulation>,
    binaries: Option<&dyn ObjectStore>,
) -> Result<Vec<ScanRequest>, PlanError> {
    let needs_population = modes.iter().any(|m| m != ScanMode::Binary.as_str());
    let modspecs = if needs_population {
        read_population(params, population).await?
    } else {
        Vec::new()
    };

    let mut requests = Vec::new();
    for mode in modes {
        if mode == ScanMode::Binary.as_str() {
            requests.extend(read_binaries(binaries).await?);
            continue;
        }
        requests.extend(
            modspecs
                .iter()
                .filter(|spec| spec.imported_by >= params.min_imported_by)
                .map(|spec| ScanRequest {
                    coordinate: ModuleUrlPath::new(&spec.module, &spec.version),
                    params: ScanRequestParams {
                        imported_by: spec.imported_by,
                        mode: mode.clone(),
                        insecure: false,
                    },
                }),
        );
    }

    // ignore the standard library
    requests.retain(|req| req.coordinate.module != "std");

    let mut seen = HashSet::new();
    requests.retain(|req| {
        seen.insert(new_task_id(
            &req.coordinate.module,
            &req.coordinate.version,
        ))
    });
    Ok(requests)
}

async fn read_population(
    params: &EnqueueParams,
    population: Option<&dyn ModulePopulation>,
) -> Result<Vec<ModuleSpec>, PlanError> {
    if let Some(file) = params.file.as_deref().filter(|f| !f.is_empty()) {
        return read_module_file(Path::new(file)).await;
    }
    match population {
        Some(source) => source.modules(params.min_imported_by).await,
        None => Err(PlanError::Population(
            "no module population configured; pass file= or set a population source".to_string(),
        )),
    }
}

/// Reads a module population file: whitespace-separated
/// `module version [imported_by]` lines, `#` starting a comment line.
pub async fn read_module_file(path: &Path) -> Result<Vec<ModuleSpec>, PlanError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut specs = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(module), Some(version)) = (fields.next(), fields.next()) else {
            return Err(PlanError::Population(format!(
                "{}:{}: want 'module version [imported_by]'",
                path.display(),
                lineno + 1
            )));
        };
        let imported_by = match fields.next() {
            None => 0,
            Some(n) => n.parse().map_err(|_| {
                PlanError::Population(format!(
                    "{}:{}: bad imported_by {n:?}",
                    path.display(),
                    lineno + 1
                ))
            })?,
        };
        specs.push(ModuleSpec {
            module: module.to_string(),
            version: version.to_string(),
            imported_by,
        });
    }
    Ok(specs)
}

/// Enumerates uploaded binaries and turns each object name back into a scan
/// request. A missing binary bucket yields an empty plan, not an error.
async fn read_binaries(
    binaries: Option<&dyn ObjectStore>,
) -> Result<Vec<ScanRequest>, PlanError> {
    let Some(store) = binaries else {
        info!("binary bucket not configured; not enqueuing binaries");
        return Ok(Vec::new());
    };
    let mut requests = Vec::new();
    for name in store.list(BINARY_PREFIX).await? {
        let object = name.trim_start_matches(BINARY_PREFIX);
        let coordinate = match ModuleUrlPath::parse_object_name(object) {
            Ok(coordinate) => coordinate,
            Err(err) => {
                warn!(name, %err, "skipping unparseable binary object");
                continue;
            }
        };
        requests.push(ScanRequest {
            coordinate,
            params: ScanRequestParams {
                imported_by: 0,
                mode: ScanMode::Binary.as_str().to_string(),
                insecure: false,
            },
        });
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;
    use std::io::Write;

    #[test]
    fn list_modes_single_and_default() {
        assert_eq!(list_modes(Some("imports"), false).unwrap(), vec!["IMPORTS"]);
        assert_eq!(list_modes(None, false).unwrap(), vec!["VTA"]);
        assert_eq!(list_modes(Some(""), false).unwrap(), vec!["VTA"]);
        assert!(list_modes(Some("bogus"), false).is_err());
    }

    #[test]
    fn list_modes_all_is_sorted_and_exclusive() {
        assert_eq!(
            list_modes(None, true).unwrap(),
            vec!["BINARY", "IMPORTS", "VTA", "VTASTACKS"]
        );
        assert!(list_modes(Some("VTA"), true).is_err());
    }

    #[tokio::test]
    async fn plan_from_file_filters_and_skips_std() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# population").unwrap();
        writeln!(file, "golang.org/x/text v0.3.8 120").unwrap();
        writeln!(file, "std v1.20.0 9999").unwrap();
        writeln!(file, "example.com/small v1.0.0 3").unwrap();
        file.flush().unwrap();

        let params = EnqueueParams {
            min_imported_by: 10,
            file: Some(file.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        let got = plan_requests(&params, &["VTA".to_string()], None, None)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].coordinate.module, "golang.org/x/text");
        assert_eq!(got[0].params.mode, "VTA");
        assert_eq!(got[0].params.imported_by, 120);
    }

    #[tokio::test]
    async fn plan_deduplicates_across_modes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "m v1.0.0 50").unwrap();
        file.flush().unwrap();

        let params = EnqueueParams {
            file: Some(file.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        // The same (module, version) planned for two modes collapses to one
        // descriptor: task IDs ignore the mode.
        let got = plan_requests(
            &params,
            &["IMPORTS".to_string(), "VTA".to_string()],
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].params.mode, "IMPORTS");
    }

    #[tokio::test]
    async fn plan_binaries_from_object_store() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("binaries/example.com/cli@v1.4.0/cmd/cli");
        std::fs::create_dir_all(obj.parent().unwrap()).unwrap();
        std::fs::write(&obj, b"elf").unwrap();

        let store = FsObjectStore::new(dir.path());
        let got = plan_requests(
            &EnqueueParams::default(),
            &["BINARY".to_string()],
            None,
            Some(&store),
        )
        .await
        .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].coordinate.module, "example.com/cli");
        assert_eq!(got[0].coordinate.version, "v1.4.0");
        assert_eq!(got[0].coordinate.suffix, "cmd/cli");
        assert_eq!(got[0].params.mode, "BINARY");
    }

    #[tokio::test]
    async fn plan_binaries_without_bucket_is_empty() {
        let got = plan_requests(
            &EnqueueParams::default(),
            &["BINARY".to_string()],
            None,
            None,
        )
        .await
        .unwrap();
        assert!(got.is_empty());
    }
}
