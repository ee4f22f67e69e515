use outpost_domain::DeploymentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
