use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("manifest {}: missing {field}", path.display())]
    MissingManifest { path: PathBuf, field: String },
    #[error("manifest {} is not valid JSON: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },
    #[error("parser output for {dir} lacks `{field}`")]
    IncompleteParse { dir: String, field: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
