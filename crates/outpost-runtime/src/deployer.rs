use async_trait::async_trait;
use outpost_domain::{AppDeployment, DeploymentProfileType};
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;

/// A type-specific deployment backend. One implementation per
/// `deploymentProfile.type`; selection happens in
/// [`RuntimeRegistry`](crate::RuntimeRegistry) at dispatch time.
///
/// Every call is cancellable. On cancel a deployer attempts a clean local
/// stop but is not required to reverse remote state already applied; the
/// reconciler re-drives the deployment on the next start.
#[async_trait]
pub trait Deployer: Send + Sync + 'static {
    /// The profile type this deployer serves.
    fn profile(&self) -> DeploymentProfileType;

    /// First-time install of every component in the deployment.
    async fn deploy(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError>;

    /// Converge an already-installed deployment onto a changed spec.
    async fn update(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError>;

    /// Tear down every component. Receives the full descriptor because
    /// release and project names derive from component names. Removing
    /// something already gone must succeed.
    async fn remove(
        &self,
        cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError>;
}

impl std::fmt::Debug for dyn Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Deployer")
            .field("profile", &self.profile())
            .finish()
    }
}
