use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_domain::{AppDeployment, ComponentState, DeploymentProfileType};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One observation of a running (or absent) workload, already translated
/// into the canonical component vocabulary.
#[derive(Debug, Clone)]
pub struct WorkloadStatus {
    /// Component name within the deployment.
    pub component: String,
    /// Runtime-side identity: Helm release or Compose project name.
    pub workload_id: String,
    pub state: ComponentState,
    pub health: WorkloadHealth,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A per-runtime status probe. Monitors are stateless: the watcher owns the
/// per-deployment poll tasks and writes observations back to the store.
#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    fn profile(&self) -> DeploymentProfileType;

    /// Probe the runtime once, returning one observation per component.
    async fn status(
        &self,
        deployment: &AppDeployment,
    ) -> Result<Vec<WorkloadStatus>, RuntimeError>;
}
