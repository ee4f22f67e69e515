use std::path::PathBuf;
use std::time::Duration;

/// Fully validated agent configuration. Produced by [`crate::load_config`];
/// construction bypassing validation is only done in tests.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device id used in fleet-manager URLs. None means "generate and persist
    /// on first start".
    pub device_id: Option<String>,
    /// Home of state.json, the lock file and compose project directories.
    pub data_dir: PathBuf,
    pub wfm: WfmConfig,
    pub state_seeking: StateSeekingConfig,
    pub capabilities: CapabilitiesConfig,
    pub onboarding: OnboardingConfig,
    pub runtimes: Vec<RuntimeEntry>,
    pub log_level: LogLevel,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct WfmConfig {
    /// Base URL of the fleet-manager southbound endpoint.
    pub sbi_url: String,
    /// Optional pinned CA certificate (PEM).
    pub ca_cert_path: Option<PathBuf>,
    /// Optional static OAuth2 client-credentials. Credentials received from
    /// onboarding take precedence.
    pub auth: Option<OauthConfig>,
}

#[derive(Debug, Clone)]
pub struct OauthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct StateSeekingConfig {
    pub interval: Duration,
    /// Prefer the bundle when the manifest lists more than this many deployments.
    pub bundle_deployment_threshold: usize,
    /// Prefer the bundle when its declared size is below this cap.
    pub bundle_size_cap_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CapabilitiesConfig {
    pub read_from_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct OnboardingConfig {
    pub signature_file: PathBuf,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub enum RuntimeEntry {
    Kubernetes(KubernetesRuntimeConfig),
    Docker(DockerRuntimeConfig),
}

#[derive(Debug, Clone)]
pub struct KubernetesRuntimeConfig {
    /// Empty means in-cluster service-account auth.
    pub kubeconfig_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    pub url: String,
    pub tls: Option<DockerTlsConfig>,
    pub tls_skip_verification: bool,
}

#[derive(Debug, Clone)]
pub struct DockerTlsConfig {
    pub cacert_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Spelling accepted by tracing's EnvFilter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Operation deadlines, overridable through the optional `timeouts:` section
/// of the config file.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub onboard_attempt: Duration,
    pub sync_cycle: Duration,
    pub deployer_op: Duration,
    pub monitor_poll: Duration,
    pub status_report: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            onboard_attempt: Duration::from_secs(10),
            sync_cycle: Duration::from_secs(30),
            deployer_op: Duration::from_secs(600),
            monitor_poll: Duration::from_secs(10),
            status_report: Duration::from_secs(10),
        }
    }
}
