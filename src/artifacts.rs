use std::fs;
use std::io::BufReader;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PipelineError, Result};

pub const FEATURE_SPEC: &str = "feature_spec.json";
pub const ENCODER: &str = "encoder.json";
pub const HARD_MODEL: &str = "kmeans.json";
pub const SOFT_MODEL: &str = "gmm.json";
pub const CENTROIDS: &str = "centroids.csv";

/// File-backed key/value store for fitted artifacts. Handles are cheap and
/// carry no open files; every read or write opens and closes its own file.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| PipelineError::io(&self.root, e))
    }

    /// Writes through a temporary sibling and renames it into place so
    /// readers never observe a half-written artifact.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        self.ensure_root()?;
        let path = self.path(name);
        let staging = self.path(&format!(".{name}.tmp"));
        let body = serde_json::to_vec_pretty(value)?;
        fs::write(&staging, body).map_err(|e| PipelineError::io(&staging, e))?;
        fs::rename(&staging, &path).map_err(|e| PipelineError::io(&path, e))?;
        tracing::debug!(artifact = name, path = %path.display(), "artifact saved");
        Ok(path)
    }

    /// Returns `Ok(None)` when the artifact has never been written.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let file = fs::File::open(&path).map_err(|e| PipelineError::io(&path, e))?;
        let value = serde_json::from_reader(BufReader::new(file))?;
        tracing::debug!(artifact = name, path = %path.display(), "artifact loaded");
        Ok(Some(value))
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        if path.is_file() {
            fs::remove_file(&path).map_err(|e| PipelineError::io(&path, e))?;
        }
        Ok(())
    }
}
