use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The two manifest schemas, selected by the `type` discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Marketplace,
    Plugin,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Marketplace => "marketplace",
            ManifestKind::Plugin => "plugin",
        }
    }

    pub fn from_discriminant(value: &str) -> Option<Self> {
        match value {
            "marketplace" => Some(ManifestKind::Marketplace),
            "plugin" => Some(ManifestKind::Plugin),
            _ => None,
        }
    }

    /// Guess the schema from a conventional file name
    pub fn from_path(path: &str) -> Option<Self> {
        let file = path.rsplit('/').next().unwrap_or(path);
        let stem = file.split('.').next().unwrap_or(file);
        match stem {
            "marketplace" => Some(ManifestKind::Marketplace),
            "plugin" => Some(ManifestKind::Plugin),
            _ => None,
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Undecoded fetch result
#[derive(Debug, Clone)]
pub struct RawManifestContent {
    pub path: String,
    pub encoding: String,
    pub raw: Vec<u8>,
    pub size_bytes: u64,
}

/// Outcome of validating manifest text or data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub kind: Option<ManifestKind>,
    /// Absent when the bounds, syntax or required-field checks failed
    pub data: Option<Value>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn into_result(self) -> Result<Value> {
        match (self.is_valid, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(Error::ValidationFailed {
                errors: self.errors,
                warnings: self.warnings,
            }),
        }
    }
}

/// A fetched, decoded and validated manifest. Invalid manifests are kept
/// with their errors for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedManifest {
    pub path: String,
    pub kind: Option<ManifestKind>,
    pub data: Option<Value>,
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Hex SHA-256 of the decoded content
    pub sha256: String,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
}

impl ParsedManifest {
    pub fn from_report(
        path: impl Into<String>,
        report: ValidationReport,
        sha256: String,
        size_bytes: u64,
    ) -> Self {
        Self {
            path: path.into(),
            kind: report.kind,
            data: report.data,
            is_valid: report.is_valid,
            errors: report.errors,
            warnings: report.warnings,
            sha256,
            size_bytes,
            fetched_at: Utc::now(),
        }
    }

    /// Keep only valid manifests; invalid ones become
    /// [`Error::ValidationFailed`] carrying the findings
    pub fn into_valid(self) -> Result<Self> {
        if self.is_valid && self.data.is_some() {
            Ok(self)
        } else {
            Err(Error::ValidationFailed {
                errors: self.errors,
                warnings: self.warnings,
            })
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.data.as_ref()?.get("name")?.as_str()
    }

    pub fn version(&self) -> Option<&str> {
        self.data.as_ref()?.get("version")?.as_str()
    }
}

/// A manifest lookup either finds a file or positively establishes that
/// there is none. Absence is the common case and not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ManifestOutcome {
    Found(ParsedManifest),
    Missing { path: String },
}

impl ManifestOutcome {
    pub fn exists(&self) -> bool {
        matches!(self, ManifestOutcome::Found(_))
    }

    pub fn manifest(&self) -> Option<&ParsedManifest> {
        match self {
            ManifestOutcome::Found(manifest) => Some(manifest),
            ManifestOutcome::Missing { .. } => None,
        }
    }

    pub fn into_manifest(self) -> Option<ParsedManifest> {
        match self {
            ManifestOutcome::Found(manifest) => Some(manifest),
            ManifestOutcome::Missing { .. } => None,
        }
    }
}
