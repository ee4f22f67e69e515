use thiserror::Error;

/// Fleet-manager client errors, grouped by recovery policy: transport and
/// protocol errors are retried by the caller's next tick, auth errors count
/// against the onboarding cap, integrity errors reject the cycle or the
/// deployment they concern.
#[derive(Debug, Error)]
pub enum WfmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{context} returned HTTP {status}: {body}")]
    Status {
        context: String,
        status: u16,
        body: String,
    },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("manifest error: {0}")]
    Manifest(String),
}

impl From<reqwest::Error> for WfmError {
    fn from(e: reqwest::Error) -> Self {
        WfmError::Transport(e.to_string())
    }
}
