mod raw;
mod loader;
pub mod error;
pub mod types;

pub use error::ConfigError;
pub use loader::load_config;
pub use types::{
    AgentConfig, CapabilitiesConfig, DockerRuntimeConfig, DockerTlsConfig,
    KubernetesRuntimeConfig, LogLevel, OauthConfig, OnboardingConfig,
    RuntimeEntry, StateSeekingConfig, Timeouts, WfmConfig,
};
