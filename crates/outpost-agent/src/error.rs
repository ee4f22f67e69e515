use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(#[from] outpost_config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] outpost_store::StoreError),

    #[error("fleet manager error: {0}")]
    Wfm(#[from] outpost_wfm::WfmError),

    #[error("device signature file {path}: {source}")]
    SignatureFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("onboarding failed after {attempts} attempts: {last_error}")]
    OnboardingExhausted { attempts: u32, last_error: String },

    #[error("another agent holds the lock file {path}")]
    LockHeld { path: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shutdown requested")]
    ShuttingDown,
}
