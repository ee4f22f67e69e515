use outpost_domain::DeploymentProfileType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no runtime registered for profile type {0}")]
    UnsupportedProfile(DeploymentProfileType),

    #[error("failed to spawn {binary}: {message}")]
    Spawn { binary: String, message: String },

    #[error("{context} exited with code {code}: {detail}")]
    CommandFailed {
        context: String,
        code: i32,
        detail: String,
    },

    #[error("{context} timed out after {seconds}s")]
    Timeout { context: String, seconds: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("package fetch failed: {0}")]
    PackageFetch(String),

    #[error("invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("status probe failed: {0}")]
    Probe(String),

    #[error("internal runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Fatal errors cannot succeed on retry with the same desired state;
    /// the reconciler parks them until the desired digest changes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnsupportedProfile(_) | RuntimeError::InvalidDeployment(_)
        )
    }
}
