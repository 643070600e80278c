use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("artifact {artifact} has not been fitted and nothing is persisted")]
    MissingArtifact { artifact: &'static str },
    #[error("input is missing fit-time column {column}")]
    SchemaMismatch { column: String },
    #[error("feature width {found} does not match trained width {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("cannot fit on an empty feature matrix")]
    EmptyInput,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
