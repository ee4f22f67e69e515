pub mod digest;
pub mod error;
pub mod types;

pub use digest::Digest;
pub use error::DomainError;
pub use types::{
    AppDeployment, AppState, ComponentSpec, ComponentStatus, ComponentState,
    ComposeComponent, DeploymentId, DeploymentPhase, DeploymentProfile,
    DeploymentProfileType, DeploymentRecord, DeviceIdentity, HelmComponent,
    ManifestMetadata, OnboardingState, TargetState,
};
