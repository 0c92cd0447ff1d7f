//! Parsing of scan endpoint paths and query parameters.

use ecoscan_model::{ModuleUrlPath, ScanMode, ScanRequest, ScanRequestParams};
use serde::Deserialize;

use crate::errors::ScanError;

/// Raw query parameters of the scan endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ScanQuery {
    pub mode: Option<String>,
    pub importedby: Option<String>,
    pub insecure: Option<String>,
    pub proxyfetch: Option<String>,
}

/// A fully parsed scan invocation.
#[derive(Debug)]
pub struct ParsedScan {
    pub request: ScanRequest,
    /// Present only when the `insecure` query param was given non-empty; it
    /// then overrides the worker's configured default. An empty value keeps
    /// the default.
    pub insecure_override: Option<bool>,
    pub disable_proxy_fetch: bool,
}

/// Parses the module path segment and query parameters of one scan request.
/// The mode defaults to VTA and must name a known analysis.
pub fn parse_scan_request(module_path: &str, query: &ScanQuery) -> Result<ParsedScan, ScanError> {
    let coordinate = ModuleUrlPath::parse(module_path)
        .map_err(|err| ScanError::InvalidArgument(err.to_string()))?;

    let mode = match query.mode.as_deref().filter(|m| !m.is_empty()) {
        None => ScanMode::Vta.as_str().to_string(),
        Some(m) => {
            let mode = m.to_ascii_uppercase();
            if !ScanMode::is_valid(&mode) {
                return Err(ScanError::InvalidArgument(format!("unsupported mode: {m}")));
            }
            mode
        }
    };

    let imported_by = match query.importedby.as_deref().filter(|v| !v.is_empty()) {
        None => 0,
        Some(v) => v
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or_else(|| ScanError::InvalidArgument(format!("bad importedby value {v:?}")))?,
    };

    let insecure_override = match query.insecure.as_deref() {
        None | Some("") => None,
        Some(v) => Some(parse_bool(v).ok_or_else(|| {
            ScanError::InvalidArgument(format!("bad insecure value {v:?}"))
        })?),
    };

    Ok(ParsedScan {
        request: ScanRequest {
            coordinate,
            params: ScanRequestParams {
                imported_by,
                mode,
                insecure: insecure_override.unwrap_or(false),
            },
        },
        insecure_override,
        disable_proxy_fetch: query.proxyfetch.as_deref() == Some("off"),
    })
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(mode: &str, importedby: &str, insecure: &str) -> ScanQuery {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        ScanQuery {
            mode: opt(mode),
            importedby: opt(importedby),
            insecure: opt(insecure),
            proxyfetch: None,
        }
    }

    #[test]
    fn defaults_mode_to_vta() {
        let parsed = parse_scan_request("m/@v/v1.0.0", &ScanQuery::default()).unwrap();
        assert_eq!(parsed.request.params.mode, "VTA");
        assert_eq!(parsed.request.params.imported_by, 0);
        assert_eq!(parsed.insecure_override, None);
        assert!(!parsed.disable_proxy_fetch);
    }

    #[test]
    fn parses_full_query() {
        let parsed =
            parse_scan_request("m/@v/v1.0.0/cmd/x", &query("binary", "120", "true")).unwrap();
        assert_eq!(parsed.request.coordinate.suffix, "cmd/x");
        assert_eq!(parsed.request.params.mode, "BINARY");
        assert_eq!(parsed.request.params.imported_by, 120);
        assert_eq!(parsed.insecure_override, Some(true));
    }

    #[test]
    fn empty_insecure_keeps_default() {
        // An explicitly empty value means "use the worker default", not
        // "force secure".
        let q = ScanQuery {
            insecure: Some(String::new()),
            ..ScanQuery::default()
        };
        let parsed = parse_scan_request("m/@v/v1.0.0", &q).unwrap();
        assert_eq!(parsed.insecure_override, None);
    }

    #[test]
    fn rejects_bad_inputs() {
        for (path, q) in [
            ("m-without-version", ScanQuery::default()),
            ("m/@v/v1.0.0", query("bogus", "", "")),
            ("m/@v/v1.0.0", query("", "-3", "")),
            ("m/@v/v1.0.0", query("", "x", "")),
            ("m/@v/v1.0.0", query("", "", "maybe")),
        ] {
            let got = parse_scan_request(path, &q);
            assert!(
                matches!(got, Err(ScanError::InvalidArgument(_))),
                "{path} {q:?}"
            );
        }
    }

    #[test]
    fn proxyfetch_off_is_recognized() {
        let q = ScanQuery {
            proxyfetch: Some("off".to_string()),
            ..ScanQuery::default()
        };
        assert!(parse_scan_request("m/@v/v1.0.0", &q).unwrap().disable_proxy_fetch);
    }
}
