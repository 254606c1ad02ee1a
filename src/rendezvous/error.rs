use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Request(#[from] anyhow::Error),
    #[error("directory returned status {status} for {path}")]
    Status { status: u16, path: String },
    #[error("invalid directory data at {path}: {reason}")]
    InvalidData { path: String, reason: String },
    #[error("could not encode peer record: {0}")]
    Encode(#[from] serde_json::Error),
}
