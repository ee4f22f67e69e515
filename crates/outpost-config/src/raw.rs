use serde::Deserialize;

/// Raw YAML representation of the agent config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(rename = "dataDir")]
    pub data_dir: Option<String>,
    pub wfm: RawWfm,
    #[serde(rename = "stateSeeking")]
    pub state_seeking: Option<RawStateSeeking>,
    pub capabilities: Option<RawCapabilities>,
    pub onboarding: Option<RawOnboarding>,
    #[serde(default)]
    pub runtimes: Vec<RawRuntime>,
    pub logging: Option<RawLogging>,
    pub timeouts: Option<RawTimeouts>,
}

#[derive(Debug, Deserialize)]
pub struct RawWfm {
    #[serde(rename = "sbiUrl")]
    pub sbi_url: String,
    #[serde(rename = "caCertPath")]
    pub ca_cert_path: Option<String>,
    pub auth: Option<RawOauth>,
}

#[derive(Debug, Deserialize)]
pub struct RawOauth {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "tokenUrl")]
    pub token_url: String,
}

#[derive(Debug, Deserialize)]
pub struct RawStateSeeking {
    /// Seconds between sync cycles.
    pub interval: Option<i64>,
    #[serde(rename = "bundleDeploymentThreshold")]
    pub bundle_deployment_threshold: Option<usize>,
    #[serde(rename = "bundleSizeCapBytes")]
    pub bundle_size_cap_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawCapabilities {
    #[serde(rename = "readFromFile")]
    pub read_from_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawOnboarding {
    #[serde(rename = "signatureFile")]
    pub signature_file: Option<String>,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RawRuntime {
    #[serde(rename = "type")]
    pub runtime_type: String,
    pub kubernetes: Option<RawKubernetes>,
    pub docker: Option<RawDocker>,
}

#[derive(Debug, Deserialize)]
pub struct RawKubernetes {
    #[serde(rename = "kubeconfigPath")]
    pub kubeconfig_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawDocker {
    pub url: String,
    pub tls: Option<RawDockerTls>,
    #[serde(rename = "tlsSkipVerification", default)]
    pub tls_skip_verification: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawDockerTls {
    #[serde(rename = "cacertPath")]
    pub cacert_path: String,
    #[serde(rename = "certPath")]
    pub cert_path: String,
    #[serde(rename = "keyPath")]
    pub key_path: String,
}

#[derive(Debug, Deserialize)]
pub struct RawLogging {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawTimeouts {
    #[serde(rename = "onboardAttemptSecs")]
    pub onboard_attempt_secs: Option<u64>,
    #[serde(rename = "syncCycleSecs")]
    pub sync_cycle_secs: Option<u64>,
    #[serde(rename = "deployerOpSecs")]
    pub deployer_op_secs: Option<u64>,
    #[serde(rename = "monitorPollSecs")]
    pub monitor_poll_secs: Option<u64>,
    #[serde(rename = "statusReportSecs")]
    pub status_report_secs: Option<u64>,
}
