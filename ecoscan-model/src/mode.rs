//! Analysis modes supported by the vulnerability analyzer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Analyzer strategy for a single scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanMode {
    /// Import-level analysis only.
    Imports,
    /// Variable type analysis; the default mode.
    Vta,
    /// VTA with call stacks computed additionally.
    VtaStacks,
    /// Analysis of an uploaded binary artifact.
    Binary,
}

impl ScanMode {
    /// All known modes, sorted by their wire names. The order is relied on
    /// for deterministic enqueue-all planning.
    pub const ALL: [ScanMode; 4] = [
        ScanMode::Binary,
        ScanMode::Imports,
        ScanMode::Vta,
        ScanMode::VtaStacks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Imports => "IMPORTS",
            ScanMode::Vta => "VTA",
            ScanMode::VtaStacks => "VTASTACKS",
            ScanMode::Binary => "BINARY",
        }
    }

    pub fn is_valid(mode: &str) -> bool {
        mode.parse::<ScanMode>().is_ok()
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IMPORTS" => Ok(ScanMode::Imports),
            "VTA" => Ok(ScanMode::Vta),
            "VTASTACKS" => Ok(ScanMode::VtaStacks),
            "BINARY" => Ok(ScanMode::Binary),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported mode: {0}")]
pub struct UnknownMode(pub String);
