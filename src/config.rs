use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::db::UPSERT_COLUMNS;
use crate::error::{PipelineError, Result};

pub const CONFIG_ENV: &str = "PATHWAYS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "pathways.toml";
pub const DEFAULT_DIFFICULTY_LEVELS: i64 = 3;
pub const DEFAULT_STORE_BATCH: usize = 5000;
/// Largest batch whose upsert stays within Postgres's 65535 bind parameters.
pub const MAX_STORE_BATCH: usize = u16::MAX as usize / UPSERT_COLUMNS;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub features: FeatureCandidates,
    #[serde(default)]
    pub imputation: ImputationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_difficulty_levels")]
    pub difficulty_levels: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_artifacts")]
    pub artifacts: PathBuf,
    #[serde(default = "default_reports")]
    pub reports: PathBuf,
    #[serde(default = "default_knowledge")]
    pub knowledge: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_n_clusters")]
    pub n_clusters: usize,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
    #[serde(default = "default_quality_sample")]
    pub quality_sample: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureCandidates {
    #[serde(default = "default_numeric")]
    pub numeric: Vec<String>,
    #[serde(default = "default_categorical")]
    pub categorical: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImputationConfig {
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,
    #[serde(default = "default_true")]
    pub sample_missing: bool,
    #[serde(default = "default_difficulty")]
    pub default_difficulty: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_batch")]
    pub batch_size: usize,
}

impl AppConfig {
    /// Reads the TOML file at `path`, or `PATHWAYS_CONFIG`, or
    /// `pathways.toml`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
            Self::from_toml(&raw)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.difficulty_levels < 1 {
            return Err(PipelineError::Config(
                "difficulty_levels must be at least 1".to_string(),
            ));
        }
        if self.training.n_clusters == 0 {
            return Err(PipelineError::Config(
                "training.n_clusters must be positive".to_string(),
            ));
        }
        if self.training.chunk_size == 0 || self.training.sample_cap == 0 {
            return Err(PipelineError::Config(
                "training.chunk_size and training.sample_cap must be positive".to_string(),
            ));
        }
        if self.store.batch_size == 0 {
            return Err(PipelineError::Config(
                "store.batch_size must be positive".to_string(),
            ));
        }
        if self.store.batch_size > MAX_STORE_BATCH {
            return Err(PipelineError::Config(format!(
                "store.batch_size must be at most {MAX_STORE_BATCH}"
            )));
        }
        Ok(())
    }

    pub fn max_level(&self) -> i64 {
        self.difficulty_levels - 1
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            training: TrainingConfig::default(),
            features: FeatureCandidates::default(),
            imputation: ImputationConfig::default(),
            store: StoreConfig::default(),
            difficulty_levels: DEFAULT_DIFFICULTY_LEVELS,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            artifacts: default_artifacts(),
            reports: default_reports(),
            knowledge: default_knowledge(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_clusters: default_n_clusters(),
            random_state: default_random_state(),
            max_iter: default_max_iter(),
            chunk_size: default_chunk_size(),
            sample_cap: default_sample_cap(),
            quality_sample: default_quality_sample(),
        }
    }
}

impl Default for FeatureCandidates {
    fn default() -> Self {
        Self {
            numeric: default_numeric(),
            categorical: default_categorical(),
        }
    }
}

impl Default for ImputationConfig {
    fn default() -> Self {
        Self {
            min_rows: default_min_rows(),
            sample_missing: true,
            default_difficulty: default_difficulty(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: default_store_batch(),
        }
    }
}

fn default_artifacts() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_reports() -> PathBuf {
    PathBuf::from("reports")
}

fn default_knowledge() -> PathBuf {
    PathBuf::from("knowledge")
}

fn default_n_clusters() -> usize {
    3
}

fn default_random_state() -> u64 {
    42
}

fn default_max_iter() -> usize {
    300
}

fn default_chunk_size() -> usize {
    200_000
}

fn default_sample_cap() -> usize {
    300_000
}

fn default_quality_sample() -> usize {
    10_000
}

fn default_numeric() -> Vec<String> {
    vec![
        "time_spent".to_string(),
        "avg_score".to_string(),
        "accuracy".to_string(),
    ]
}

fn default_categorical() -> Vec<String> {
    vec!["difficulty_level".to_string()]
}

fn default_min_rows() -> usize {
    3000
}

fn default_true() -> bool {
    true
}

fn default_difficulty() -> i64 {
    1
}

fn default_store_batch() -> usize {
    DEFAULT_STORE_BATCH
}

fn default_difficulty_levels() -> i64 {
    DEFAULT_DIFFICULTY_LEVELS
}
