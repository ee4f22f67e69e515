use std::collections::HashMap;
use std::sync::Arc;

use outpost_domain::DeploymentProfileType;

use crate::deployer::Deployer;
use crate::error::RuntimeError;
use crate::monitor::Monitor;

/// Dispatches deployer and monitor calls to the implementation registered
/// for a deployment's profile type. Adding a runtime is purely additive:
/// register a new deployer/monitor pair under a new tag.
#[derive(Default)]
pub struct RuntimeRegistry {
    deployers: HashMap<DeploymentProfileType, Arc<dyn Deployer>>,
    monitors: HashMap<DeploymentProfileType, Arc<dyn Monitor>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        profile: DeploymentProfileType,
        deployer: Arc<dyn Deployer>,
        monitor: Arc<dyn Monitor>,
    ) -> &mut Self {
        self.deployers.insert(profile, deployer);
        self.monitors.insert(profile, monitor);
        self
    }

    pub fn deployer_for(
        &self,
        profile: DeploymentProfileType,
    ) -> Result<Arc<dyn Deployer>, RuntimeError> {
        self.deployers
            .get(&profile)
            .cloned()
            .ok_or(RuntimeError::UnsupportedProfile(profile))
    }

    pub fn monitor_for(
        &self,
        profile: DeploymentProfileType,
    ) -> Result<Arc<dyn Monitor>, RuntimeError> {
        self.monitors
            .get(&profile)
            .cloned()
            .ok_or(RuntimeError::UnsupportedProfile(profile))
    }

    /// All profile types with a registered runtime.
    pub fn profiles(&self) -> Vec<DeploymentProfileType> {
        self.deployers.keys().copied().collect()
    }
}
