//! Module coordinates and their URL-path encoding.
//!
//! A scan endpoint addresses a module as `<module>/@v/<version>[/<suffix>]`,
//! where the suffix names a subdirectory or an uploaded binary artifact and
//! may itself contain slashes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between the module path and the version in URL paths.
const VERSION_MARKER: &str = "/@v/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsePathError {
    #[error("invalid module path {0:?}: missing /@v/ version marker")]
    MissingVersionMarker(String),
    #[error("invalid module path {0:?}: empty module")]
    EmptyModule(String),
    #[error("invalid module path {0:?}: empty version")]
    EmptyVersion(String),
}

/// A module coordinate as it appears in scan URLs and task names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleUrlPath {
    pub module: String,
    pub version: String,
    /// Optional subdirectory or binary name; empty when absent.
    #[serde(default)]
    pub suffix: String,
}

impl ModuleUrlPath {
    pub fn new(module: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            suffix: String::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Parses `<module>/@v/<version>[/<suffix>]`. The input must not carry a
    /// leading slash; routing strips it before the coordinate is parsed.
    pub fn parse(path: &str) -> Result<Self, ParsePathError> {
        let Some(marker) = path.find(VERSION_MARKER) else {
            return Err(ParsePathError::MissingVersionMarker(path.to_string()));
        };
        let module = &path[..marker];
        if module.is_empty() {
            return Err(ParsePathError::EmptyModule(path.to_string()));
        }
        let rest = &path[marker + VERSION_MARKER.len()..];
        let (version, suffix) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash + 1..]),
            None => (rest, ""),
        };
        if version.is_empty() {
            return Err(ParsePathError::EmptyVersion(path.to_string()));
        }
        Ok(Self {
            module: module.to_string(),
            version: version.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Parses a blob-store object name of the form
    /// `<module>@<version>[/<suffix>]`, the layout used for uploaded
    /// analysis binaries.
    pub fn parse_object_name(name: &str) -> Result<Self, ParsePathError> {
        let Some(at) = name.find('@') else {
            return Err(ParsePathError::MissingVersionMarker(name.to_string()));
        };
        let module = &name[..at];
        if module.is_empty() {
            return Err(ParsePathError::EmptyModule(name.to_string()));
        }
        let rest = &name[at + 1..];
        let (version, suffix) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash + 1..]),
            None => (rest, ""),
        };
        if version.is_empty() {
            return Err(ParsePathError::EmptyVersion(name.to_string()));
        }
        Ok(Self {
            module: module.to_string(),
            version: version.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// The URL-path rendering, inverse of [`ModuleUrlPath::parse`].
    pub fn url_path(&self) -> String {
        let mut s = format!("{}/@v/{}", self.module, self.version);
        if !self.suffix.is_empty() {
            s.push('/');
            s.push_str(&self.suffix);
        }
        s
    }
}

impl fmt::Display for ModuleUrlPath {
    /// Human-readable `module@version[/suffix]` used in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.version)?;
        if !self.suffix.is_empty() {
            write!(f, "/{}", self.suffix)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_without_suffix() {
        let got = ModuleUrlPath::parse("github.com/a/b/@v/v1.2.3").unwrap();
        assert_eq!(got.module, "github.com/a/b");
        assert_eq!(got.version, "v1.2.3");
        assert_eq!(got.suffix, "");
    }

    #[test]
    fn parse_with_nested_suffix() {
        let got = ModuleUrlPath::parse("m/@v/v1.0.0/cmd/tool").unwrap();
        assert_eq!(got.module, "m");
        assert_eq!(got.version, "v1.0.0");
        assert_eq!(got.suffix, "cmd/tool");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(
            ModuleUrlPath::parse("no-version-here"),
            Err(ParsePathError::MissingVersionMarker(_))
        ));
        assert!(matches!(
            ModuleUrlPath::parse("/@v/v1.0.0"),
            Err(ParsePathError::EmptyModule(_))
        ));
        assert!(matches!(
            ModuleUrlPath::parse("m/@v/"),
            Err(ParsePathError::EmptyVersion(_))
        ));
    }

    #[test]
    fn url_path_round_trips() {
        for p in ["m/@v/v1.2.3", "m/@v/v1.2.3/cmd/x", "a/b/@v/v0.0.1-rc.1"] {
            let parsed = ModuleUrlPath::parse(p).unwrap();
            assert_eq!(parsed.url_path(), p);
        }
    }

    #[test]
    fn parse_object_name_forms() {
        let got = ModuleUrlPath::parse_object_name("golang.org/x/tools@v0.1.0/cmd/stringer").unwrap();
        assert_eq!(got.module, "golang.org/x/tools");
        assert_eq!(got.version, "v0.1.0");
        assert_eq!(got.suffix, "cmd/stringer");

        let got = ModuleUrlPath::parse_object_name("m@v1").unwrap();
        assert_eq!(got.suffix, "");
        assert!(ModuleUrlPath::parse_object_name("noversion").is_err());
    }

    #[test]
    fn display_includes_suffix() {
        let c = ModuleUrlPath::new("m", "v1").with_suffix("cmd/x");
        assert_eq!(c.to_string(), "m@v1/cmd/x");
    }
}
