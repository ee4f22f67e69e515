use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use outpost_domain::{
    AppDeployment, ComponentSpec, ComponentState, DeploymentId, DeploymentProfileType,
    HelmComponent,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::deployer::Deployer;
use crate::error::RuntimeError;
use crate::exec::run_command;
use crate::monitor::{Monitor, WorkloadHealth, WorkloadStatus};

/// Kubernetes runtime driven through the `helm` binary.
///
/// Install and update are the same `helm upgrade --install` invocation, so
/// re-driving a partially-applied deployment is always safe. `revision`
/// absent means latest; `wait` absent means no `--wait`.
pub struct HelmRuntime {
    /// None means in-cluster service-account auth (helm's own default).
    kubeconfig_path: Option<PathBuf>,
    op_timeout: Duration,
    probe_timeout: Duration,
}

impl HelmRuntime {
    pub fn new(
        kubeconfig_path: Option<PathBuf>,
        op_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self { kubeconfig_path, op_timeout, probe_timeout }
    }

    fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(path) = &self.kubeconfig_path {
            env.insert("KUBECONFIG".to_string(), path.display().to_string());
        }
        env
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        for component in helm_components(deployment)? {
            let release = release_name(&component.name, &deployment.deployment_id);
            let args = upgrade_args(component, &release, &deployment.parameters);
            info!(release, chart = %component.repository, "helm upgrade --install");

            let out = run_command("helm", &args, &self.env(), None, cancel, self.op_timeout).await?;
            if out.exit_code != 0 {
                return Err(RuntimeError::CommandFailed {
                    context: format!("helm upgrade {}", release),
                    code: out.exit_code,
                    detail: last_lines(&out.log, 5),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Deployer for HelmRuntime {
    fn profile(&self) -> DeploymentProfileType {
        DeploymentProfileType::HelmV3
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
        self.apply(cancel, deployment).await
    }

    async fn remove(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        for component in helm_components(deployment)? {
            let release = release_name(&component.name, &deployment.deployment_id);
            info!(release, "helm uninstall");

            let args = vec!["uninstall".to_string(), release.clone()];
            let out = run_command("helm", &args, &self.env(), None, cancel, self.op_timeout).await?;
            // a release that is already gone counts as removed
            if out.exit_code != 0 && !out.log.contains("not found") {
                return Err(RuntimeError::CommandFailed {
                    context: format!("helm uninstall {}", release),
                    code: out.exit_code,
                    detail: last_lines(&out.log, 5),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Monitor for HelmRuntime {
    fn profile(&self) -> DeploymentProfileType {
        DeploymentProfileType::HelmV3
    }

    async fn status(
        &self,
        deployment: &AppDeployment,
    ) -> Result<Vec<WorkloadStatus>, RuntimeError> {
        let mut observations = Vec::new();
        for component in helm_components(deployment)? {
            let release = release_name(&component.name, &deployment.deployment_id);
            let args = vec![
                "status".to_string(),
                release.clone(),
                "-o".to_string(),
                "json".to_string(),
            ];
            let out =
                run_command("helm", &args, &self.env(), None, &CancellationToken::new(), self.probe_timeout)
                    .await?;

            let now = Utc::now();
            if out.exit_code != 0 {
                if out.log.contains("not found") {
                    debug!(release, "release not installed yet");
                    observations.push(WorkloadStatus {
                        component: component.name.clone(),
                        workload_id: release,
                        state: ComponentState::Installing,
                        health: WorkloadHealth::Unknown,
                        message: "release not installed yet".into(),
                        timestamp: now,
                    });
                    continue;
                }
                return Err(RuntimeError::Probe(format!(
                    "helm status {}: {}",
                    release,
                    last_lines(&out.log, 3)
                )));
            }

            let value: serde_json::Value = serde_json::from_str(out.log.trim())
                .map_err(|e| RuntimeError::Probe(format!("parse helm status {}: {}", release, e)))?;
            let raw_status = value["info"]["status"].as_str().unwrap_or("unknown");
            let (state, health, message) = map_release_status(raw_status);

            observations.push(WorkloadStatus {
                component: component.name.clone(),
                workload_id: release,
                state,
                health,
                message,
                timestamp: now,
            });
        }
        Ok(observations)
    }
}

/// Release name: `<componentName>-<first 8 chars of deploymentId>`.
pub fn release_name(component: &str, id: &DeploymentId) -> String {
    format!("{}-{}", component, id.short())
}

/// Translate a Helm release status string into the canonical vocabulary.
pub fn map_release_status(status: &str) -> (ComponentState, WorkloadHealth, String) {
    match status {
        "deployed" => (ComponentState::Installed, WorkloadHealth::Healthy, "deployed".into()),
        "failed" => (ComponentState::Failed, WorkloadHealth::Unhealthy, "release failed".into()),
        "pending-install" | "pending-upgrade" | "pending-rollback" => (
            ComponentState::Installing,
            WorkloadHealth::Unknown,
            status.to_string(),
        ),
        "uninstalling" => (
            ComponentState::Uninstalling,
            WorkloadHealth::Unknown,
            "uninstalling".into(),
        ),
        other => (
            ComponentState::Failed,
            WorkloadHealth::Unknown,
            format!("unexpected helm release status '{}'", other),
        ),
    }
}

fn upgrade_args(
    component: &HelmComponent,
    release: &str,
    parameters: &std::collections::BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        release.to_string(),
        component.repository.clone(),
    ];
    if let Some(revision) = &component.revision {
        args.push("--version".to_string());
        args.push(revision.clone());
    }
    if component.wait == Some(true) {
        args.push("--wait".to_string());
    }
    for (key, value) in parameters {
        args.push("--set".to_string());
        args.push(format!("{}={}", key, value));
    }
    args
}

fn helm_components(deployment: &AppDeployment) -> Result<Vec<&HelmComponent>, RuntimeError> {
    deployment
        .profile
        .components
        .iter()
        .map(|c| match c {
            ComponentSpec::Helm(h) => Ok(h),
            ComponentSpec::Compose(c) => Err(RuntimeError::InvalidDeployment(format!(
                "component '{}' is a compose component in a helm.v3 deployment",
                c.name
            ))),
        })
        .collect()
}

fn last_lines(log: &str, n: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
