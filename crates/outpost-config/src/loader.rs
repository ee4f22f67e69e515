use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConfig, RawRuntime, RawTimeouts};
use crate::types::{
    AgentConfig, CapabilitiesConfig, DockerRuntimeConfig, DockerTlsConfig,
    KubernetesRuntimeConfig, LogLevel, OauthConfig, OnboardingConfig,
    RuntimeEntry, StateSeekingConfig, Timeouts, WfmConfig,
};

const DEFAULT_DATA_DIR: &str = "/var/lib/outpost";
const DEFAULT_SYNC_INTERVAL_SECS: i64 = 10;
const DEFAULT_BUNDLE_DEPLOYMENT_THRESHOLD: usize = 2;
const DEFAULT_BUNDLE_SIZE_CAP_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_ONBOARD_MAX_ATTEMPTS: u32 = 10;

/// Load and validate the agent config file. Any validation failure is fatal
/// at startup.
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    let config = convert(raw, path)?;
    debug!(
        runtimes = config.runtimes.len(),
        interval_secs = config.state_seeking.interval.as_secs(),
        "configuration loaded"
    );
    Ok(config)
}

fn convert(raw: RawConfig, path: &Path) -> Result<AgentConfig, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        path: path.display().to_string(),
        message,
    };

    if raw.wfm.sbi_url.trim().is_empty() {
        return Err(invalid("wfm.sbiUrl must not be empty".into()));
    }
    if !raw.wfm.sbi_url.starts_with("http://") && !raw.wfm.sbi_url.starts_with("https://") {
        return Err(invalid(format!("wfm.sbiUrl '{}' is not an http(s) URL", raw.wfm.sbi_url)));
    }

    if raw.runtimes.is_empty() {
        return Err(invalid("at least one runtimes entry is required".into()));
    }
    let runtimes = raw
        .runtimes
        .into_iter()
        .map(|r| convert_runtime(r, path))
        .collect::<Result<Vec<_>, _>>()?;

    let data_dir = PathBuf::from(
        raw.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
    );

    let seeking = raw.state_seeking.as_ref();
    let interval_secs = seeking
        .and_then(|s| s.interval)
        .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
    if interval_secs <= 0 {
        return Err(invalid(format!(
            "stateSeeking.interval must be > 0, got {}",
            interval_secs
        )));
    }

    let log_level = match raw.logging.and_then(|l| l.level) {
        None => LogLevel::default(),
        Some(level) => match level.as_str() {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            other => return Err(invalid(format!("unknown logging.level '{}'", other))),
        },
    };

    let onboarding = raw.onboarding;
    let signature_file = onboarding
        .as_ref()
        .and_then(|o| o.signature_file.as_deref())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("device.sig"));
    let max_attempts = onboarding
        .as_ref()
        .and_then(|o| o.max_attempts)
        .unwrap_or(DEFAULT_ONBOARD_MAX_ATTEMPTS);
    if max_attempts == 0 {
        return Err(invalid("onboarding.maxAttempts must be > 0".into()));
    }

    Ok(AgentConfig {
        device_id: raw.device_id,
        data_dir,
        wfm: WfmConfig {
            sbi_url: raw.wfm.sbi_url.trim_end_matches('/').to_string(),
            ca_cert_path: raw.wfm.ca_cert_path.map(PathBuf::from),
            auth: raw.wfm.auth.map(|a| OauthConfig {
                client_id: a.client_id,
                client_secret: a.client_secret,
                token_url: a.token_url,
            }),
        },
        state_seeking: StateSeekingConfig {
            interval: Duration::from_secs(interval_secs as u64),
            bundle_deployment_threshold: seeking
                .and_then(|s| s.bundle_deployment_threshold)
                .unwrap_or(DEFAULT_BUNDLE_DEPLOYMENT_THRESHOLD),
            bundle_size_cap_bytes: seeking
                .and_then(|s| s.bundle_size_cap_bytes)
                .unwrap_or(DEFAULT_BUNDLE_SIZE_CAP_BYTES),
        },
        capabilities: CapabilitiesConfig {
            read_from_file: raw
                .capabilities
                .and_then(|c| c.read_from_file)
                .map(PathBuf::from),
        },
        onboarding: OnboardingConfig { signature_file, max_attempts },
        runtimes,
        log_level,
        timeouts: convert_timeouts(raw.timeouts),
    })
}

fn convert_runtime(raw: RawRuntime, path: &Path) -> Result<RuntimeEntry, ConfigError> {
    match raw.runtime_type.as_str() {
        "KUBERNETES" => {
            let kubeconfig_path = raw
                .kubernetes
                .and_then(|k| k.kubeconfig_path)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from);
            Ok(RuntimeEntry::Kubernetes(KubernetesRuntimeConfig { kubeconfig_path }))
        }
        "DOCKER" => {
            let docker = raw.docker.ok_or_else(|| ConfigError::Invalid {
                path: path.display().to_string(),
                message: "runtime type DOCKER requires a docker: section".into(),
            })?;
            if docker.url.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    path: path.display().to_string(),
                    message: "docker.url must not be empty".into(),
                });
            }
            Ok(RuntimeEntry::Docker(DockerRuntimeConfig {
                url: docker.url,
                tls: docker.tls.map(|t| DockerTlsConfig {
                    cacert_path: PathBuf::from(t.cacert_path),
                    cert_path: PathBuf::from(t.cert_path),
                    key_path: PathBuf::from(t.key_path),
                }),
                tls_skip_verification: docker.tls_skip_verification,
            }))
        }
        other => Err(ConfigError::Invalid {
            path: path.display().to_string(),
            message: format!("unknown runtime type '{}'", other),
        }),
    }
}

fn convert_timeouts(raw: Option<RawTimeouts>) -> Timeouts {
    let defaults = Timeouts::default();
    let Some(raw) = raw else { return defaults };
    let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
    Timeouts {
        onboard_attempt: secs(raw.onboard_attempt_secs, defaults.onboard_attempt),
        sync_cycle: secs(raw.sync_cycle_secs, defaults.sync_cycle),
        deployer_op: secs(raw.deployer_op_secs, defaults.deployer_op),
        monitor_poll: secs(raw.monitor_poll_secs, defaults.monitor_poll),
        status_report: secs(raw.status_report_secs, defaults.status_report),
    }
}
