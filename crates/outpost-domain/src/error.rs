use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid digest '{0}': expected sha256:<64 lowercase hex chars>")]
    InvalidDigest(String),

    #[error("invalid deployment id: {0}")]
    InvalidDeploymentId(String),

    #[error("unknown deployment profile type '{0}'")]
    UnknownProfileType(String),
}
