use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use outpost_domain::{
    AppDeployment, ComponentSpec, ComponentState, ComposeComponent, DeploymentId,
    DeploymentProfileType,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deployer::Deployer;
use crate::error::RuntimeError;
use crate::exec::run_command;
use crate::monitor::{Monitor, WorkloadHealth, WorkloadStatus};

const PACKAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ComposeRuntimeConfig {
    /// Docker daemon endpoint, exported as `DOCKER_HOST`.
    pub host_url: String,
    /// Directory holding `ca.pem`/`cert.pem`/`key.pem`, exported as
    /// `DOCKER_CERT_PATH` when present.
    pub cert_dir: Option<PathBuf>,
    /// Exported as `DOCKER_TLS_VERIFY=1` unless verification is skipped.
    pub tls_verify: bool,
    /// Where per-project compose files are materialized.
    pub projects_dir: PathBuf,
    pub op_timeout: Duration,
    pub probe_timeout: Duration,
}

/// Docker runtime driven through the `docker compose` CLI.
///
/// Each compose component becomes one project. The package YAML is resolved
/// from `packageLocation` (http(s) fetch, `file://` read, or inline),
/// materialized under the projects directory, and brought up with the
/// deployment's parameters exported as upper-cased environment variables.
pub struct ComposeRuntime {
    config: ComposeRuntimeConfig,
    http: reqwest::Client,
}

impl ComposeRuntime {
    pub fn new(config: ComposeRuntimeConfig) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    fn docker_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("DOCKER_HOST".to_string(), self.config.host_url.clone());
        if let Some(dir) = &self.config.cert_dir {
            env.insert("DOCKER_CERT_PATH".to_string(), dir.display().to_string());
        }
        if self.config.tls_verify {
            env.insert("DOCKER_TLS_VERIFY".to_string(), "1".to_string());
        }
        env
    }

    fn project_env(&self, deployment: &AppDeployment) -> HashMap<String, String> {
        let mut env = self.docker_env();
        env.extend(parameter_env(&deployment.parameters));
        env
    }

    fn project_file(&self, project: &str) -> PathBuf {
        self.config.projects_dir.join(project).join("compose.yaml")
    }

    /// Resolve the package location into compose YAML text.
    async fn resolve_package(&self, component: &ComposeComponent) -> Result<String, RuntimeError> {
        let location = &component.package_location;
        if let Some(key) = &component.key_location {
            debug!(component = %component.name, key_location = %key, "package key location present (not enforced)");
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            let resp = self
                .http
                .get(location)
                .timeout(PACKAGE_FETCH_TIMEOUT)
                .send()
                .await
                .map_err(|e| RuntimeError::PackageFetch(format!("GET {}: {}", location, e)))?;
            if !resp.status().is_success() {
                return Err(RuntimeError::PackageFetch(format!(
                    "GET {}: HTTP {}",
                    location,
                    resp.status()
                )));
            }
            return resp
                .text()
                .await
                .map_err(|e| RuntimeError::PackageFetch(format!("read {}: {}", location, e)));
        }
        if let Some(path) = location.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RuntimeError::PackageFetch(format!("read {}: {}", path, e)));
        }
        // anything else is the compose YAML itself
        Ok(location.clone())
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        for component in compose_components(deployment)? {
            let project = project_name(&component.name, &deployment.deployment_id);
            let yaml = self.resolve_package(component).await?;

            let file = self.project_file(&project);
            let dir = file.parent().expect("project file has a parent");
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RuntimeError::Internal(format!("create {}: {}", dir.display(), e)))?;
            tokio::fs::write(&file, yaml.as_bytes())
                .await
                .map_err(|e| RuntimeError::Internal(format!("write {}: {}", file.display(), e)))?;

            info!(project, "docker compose up -d");
            let args = vec![
                "compose".to_string(),
                "-p".to_string(),
                project.clone(),
                "-f".to_string(),
                file.display().to_string(),
                "up".to_string(),
                "-d".to_string(),
            ];
            let env = self.project_env(deployment);
            let out = run_command("docker", &args, &env, None, cancel, self.config.op_timeout).await?;
            if out.exit_code != 0 {
                return Err(RuntimeError::CommandFailed {
                    context: format!("docker compose up {}", project),
                    code: out.exit_code,
                    detail: last_lines(&out.log, 5),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Deployer for ComposeRuntime {
    fn profile(&self) -> DeploymentProfileType {
        DeploymentProfileType::Compose
    }

    async fn deploy(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        self.apply(cancel, deployment).await
    }

    async fn update(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        // `compose up` converges a running project onto the new file
        self.apply(cancel, deployment).await
    }

    async fn remove(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        for component in compose_components(deployment)? {
            let project = project_name(&component.name, &deployment.deployment_id);
            info!(project, "docker compose down");

            let file = self.project_file(&project);
            let mut args = vec!["compose".to_string(), "-p".to_string(), project.clone()];
            if file.exists() {
                args.push("-f".to_string());
                args.push(file.display().to_string());
            }
            args.push("down".to_string());
            args.push("--remove-orphans".to_string());

            let out =
                run_command("docker", &args, &self.docker_env(), None, cancel, self.config.op_timeout)
                    .await?;
            if out.exit_code != 0 {
                return Err(RuntimeError::CommandFailed {
                    context: format!("docker compose down {}", project),
                    code: out.exit_code,
                    detail: last_lines(&out.log, 5),
                });
            }

            if let Some(dir) = file.parent() {
                if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %dir.display(), error = %e, "failed to clean project dir");
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Monitor for ComposeRuntime {
    fn profile(&self) -> DeploymentProfileType {
        DeploymentProfileType::Compose
    }

    async fn status(
        &self,
        deployment: &AppDeployment,
    ) -> Result<Vec<WorkloadStatus>, RuntimeError> {
        let mut observations = Vec::new();
        for component in compose_components(deployment)? {
            let project = project_name(&component.name, &deployment.deployment_id);
            let args = vec![
                "compose".to_string(),
                "-p".to_string(),
                project.clone(),
                "ps".to_string(),
                "--all".to_string(),
                "--format".to_string(),
                "json".to_string(),
            ];
            let out = run_command(
                "docker",
                &args,
                &self.docker_env(),
                None,
                &CancellationToken::new(),
                self.config.probe_timeout,
            )
            .await?;
            if out.exit_code != 0 {
                return Err(RuntimeError::Probe(format!(
                    "docker compose ps {}: {}",
                    project,
                    last_lines(&out.log, 3)
                )));
            }

            let states = parse_container_states(&out.log);
            let (state, health, message) = map_project_state(&states);
            observations.push(WorkloadStatus {
                component: component.name.clone(),
                workload_id: project,
                state,
                health,
                message,
                timestamp: Utc::now(),
            });
        }
        Ok(observations)
    }
}

/// Project name: `<lower(componentName)>-<first 8 chars of deploymentId>`,
/// with underscores replaced by hyphens.
pub fn project_name(component: &str, id: &DeploymentId) -> String {
    format!("{}-{}", component.to_lowercase().replace('_', "-"), id.short())
}

/// Upper-case the deployment parameter keys into environment variables for
/// compose interpolation.
pub fn parameter_env(
    parameters: &std::collections::BTreeMap<String, String>,
) -> HashMap<String, String> {
    parameters
        .iter()
        .map(|(k, v)| (k.to_uppercase(), v.clone()))
        .collect()
}

/// `docker compose ps --format json` emits either one JSON object per line
/// or a single array, depending on version. Extract each container's State.
fn parse_container_states(log: &str) -> Vec<String> {
    let trimmed = log.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed) {
        return items
            .iter()
            .filter_map(|v| v["State"].as_str().map(str::to_string))
            .collect();
    }
    trimmed
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|v| v["State"].as_str().map(str::to_string))
        .collect()
}

/// Aggregate container states into one canonical component state.
fn map_project_state(states: &[String]) -> (ComponentState, WorkloadHealth, String) {
    if states.is_empty() {
        return (
            ComponentState::Installing,
            WorkloadHealth::Unknown,
            "no containers yet".into(),
        );
    }
    if let Some(bad) = states.iter().find(|s| s == &"exited" || s == &"dead") {
        return (
            ComponentState::Failed,
            WorkloadHealth::Unhealthy,
            format!("container state '{}'", bad),
        );
    }
    if states.iter().any(|s| s == "removing") {
        return (
            ComponentState::Uninstalling,
            WorkloadHealth::Unknown,
            "removing".into(),
        );
    }
    if states.iter().all(|s| s == "running") {
        return (ComponentState::Installed, WorkloadHealth::Healthy, "running".into());
    }
    (
        ComponentState::Installing,
        WorkloadHealth::Unknown,
        format!("container states: {}", states.join(", ")),
    )
}

fn compose_components(deployment: &AppDeployment) -> Result<Vec<&ComposeComponent>, RuntimeError> {
    deployment
        .profile
        .components
        .iter()
        .map(|c| match c {
            ComponentSpec::Compose(c) => Ok(c),
            ComponentSpec::Helm(h) => Err(RuntimeError::InvalidDeployment(format!(
                "component '{}' is a helm component in a compose deployment",
                h.name
            ))),
        })
        .collect()
}

fn last_lines(log: &str, n: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
