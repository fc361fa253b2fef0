use std::path::PathBuf;

use thiserror::Error;

pub type IngressResult<T> = Result<T, IngressError>;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("failed to serialize ingress rules: {0}")]
    Serialize(String),

    #[error("ingress file task failed: {0}")]
    Task(String),
}
