//! Scenario manifest parsing.
//!
//! A manifest is a YAML document with a single top-level `scenario` object.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::ScenarioSpec;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub scenario: ScenarioSpec,
}

pub fn parse_manifest(contents: &str) -> Result<Manifest, ManifestError> {
    Ok(serde_yaml::from_str(contents)?)
}

pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ManifestError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_manifest(&body)
}
