use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::DomainError;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Stable identity of a deployment, assigned by the fleet manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(pub Uuid);

impl DeploymentId {
    pub fn new(u: Uuid) -> Self {
        DeploymentId(u)
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        Uuid::parse_str(s)
            .map(DeploymentId)
            .map_err(|_| DomainError::InvalidDeploymentId(s.to_string()))
    }

    /// First 8 hex chars of the hyphenated form. Release and project names
    /// are suffixed with this fragment.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Lifecycle vocabulary ──────────────────────────────────────────────────────

/// The agent's summary state for a deployment.
///
/// Transitions:
///   Pending → Deploying → Running | Failed
///   Running → Removing → Removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentPhase {
    #[default]
    Pending,
    Deploying,
    Running,
    Failed,
    Removing,
    Removed,
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentPhase::Pending => "PENDING",
            DeploymentPhase::Deploying => "DEPLOYING",
            DeploymentPhase::Running => "RUNNING",
            DeploymentPhase::Failed => "FAILED",
            DeploymentPhase::Removing => "REMOVING",
            DeploymentPhase::Removed => "REMOVED",
        };
        write!(f, "{}", s)
    }
}

/// What the fleet manager wants done with a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetState {
    #[default]
    Running,
    Removing,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Running => write!(f, "RUNNING"),
            TargetState::Removing => write!(f, "REMOVING"),
        }
    }
}

/// Canonical per-component state, as translated from runtime-specific status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentState {
    Installing,
    Installed,
    Failed,
    Uninstalling,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentState::Installing => "INSTALLING",
            ComponentState::Installed => "INSTALLED",
            ComponentState::Failed => "FAILED",
            ComponentState::Uninstalling => "UNINSTALLING",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub state: ComponentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentStatus {
    pub fn ok(state: ComponentState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { state: ComponentState::Failed, error: Some(error.into()) }
    }
}

// ── Deployment profile ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentProfileType {
    #[serde(rename = "helm.v3")]
    HelmV3,
    #[serde(rename = "compose")]
    Compose,
}

impl DeploymentProfileType {
    /// Parse the wire spelling. Unknown spellings are an error the sync loop
    /// converts to a FAILED record rather than a crash.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "helm.v3" => Ok(DeploymentProfileType::HelmV3),
            "compose" => Ok(DeploymentProfileType::Compose),
            other => Err(DomainError::UnknownProfileType(other.to_string())),
        }
    }
}

impl std::fmt::Display for DeploymentProfileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentProfileType::HelmV3 => write!(f, "helm.v3"),
            DeploymentProfileType::Compose => write!(f, "compose"),
        }
    }
}

/// One Helm release within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmComponent {
    pub name: String,
    /// Chart reference, e.g. `oci://registry/chart`.
    pub repository: String,
    /// Chart version. None means latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Pass `--wait` to helm. None means false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
}

/// One Compose project within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeComponent {
    pub name: String,
    /// `http(s)://` URL, `file://` path, or inline YAML.
    #[serde(rename = "packageLocation")]
    pub package_location: String,
    /// Optional signing-key location; preserved but not enforced.
    #[serde(rename = "keyLocation", default, skip_serializing_if = "Option::is_none")]
    pub key_location: Option<String>,
}

/// A component descriptor. The variant must agree with the profile type;
/// validation happens at manifest conversion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentSpec {
    Helm(HelmComponent),
    Compose(ComposeComponent),
}

impl ComponentSpec {
    pub fn name(&self) -> &str {
        match self {
            ComponentSpec::Helm(c) => &c.name,
            ComponentSpec::Compose(c) => &c.name,
        }
    }

    pub fn matches_profile(&self, profile: DeploymentProfileType) -> bool {
        matches!(
            (self, profile),
            (ComponentSpec::Helm(_), DeploymentProfileType::HelmV3)
                | (ComponentSpec::Compose(_), DeploymentProfileType::Compose)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentProfile {
    #[serde(rename = "type")]
    pub profile_type: DeploymentProfileType,
    pub components: Vec<ComponentSpec>,
}

// ── Desired state and its wire flattening ────────────────────────────────────

/// The desired state of one deployment as described by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDeployment {
    #[serde(rename = "deploymentId")]
    pub deployment_id: DeploymentId,
    pub name: String,
    #[serde(default)]
    pub state: TargetState,
    pub profile: DeploymentProfile,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl AppDeployment {
    pub fn component_names(&self) -> Vec<&str> {
        self.profile.components.iter().map(|c| c.name()).collect()
    }

    /// Flatten into the wire view reported to the fleet manager.
    pub fn to_app_state(&self, digest: Option<Digest>, phase: DeploymentPhase) -> AppState {
        AppState {
            deployment_id: self.deployment_id,
            name: self.name.clone(),
            state: self.state,
            profile: self.profile.clone(),
            parameters: self.parameters.clone(),
            digest,
            phase,
        }
    }
}

/// Flattened per-deployment view sent with every sync call. Carries the full
/// desired spec plus the observed digest and phase, so converting back to an
/// [`AppDeployment`] is lossless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    #[serde(rename = "deploymentId")]
    pub deployment_id: DeploymentId,
    pub name: String,
    pub state: TargetState,
    pub profile: DeploymentProfile,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub phase: DeploymentPhase,
}

impl AppState {
    pub fn into_deployment(self) -> AppDeployment {
        AppDeployment {
            deployment_id: self.deployment_id,
            name: self.name,
            state: self.state,
            profile: self.profile,
            parameters: self.parameters,
        }
    }
}

// ── Device identity ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnboardingState {
    #[serde(rename = "IN-PROGRESS")]
    InProgress,
    #[serde(rename = "ONBOARDED")]
    Onboarded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for OnboardingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OnboardingState::InProgress => "IN-PROGRESS",
            OnboardingState::Onboarded => "ONBOARDED",
            OnboardingState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// One per device, created during onboarding, persisted forever.
/// Once `ONBOARDED` the identity is immutable except for credential rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(rename = "deviceClientId")]
    pub device_client_id: String,
    /// Opaque signature attested at first boot, carried on onboarding.
    #[serde(rename = "deviceSignature")]
    pub device_signature: String,
    #[serde(rename = "authEnabled")]
    pub auth_enabled: bool,
    #[serde(rename = "oauthClientId", default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(rename = "oauthClientSecret", default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
    #[serde(rename = "oauthTokenUrl", default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_url: Option<String>,
    pub state: OnboardingState,
}

// ── Manifest metadata ─────────────────────────────────────────────────────────

/// Singleton per device. `last_synced_manifest_version` is monotonically
/// non-decreasing; a lower inbound version is rejected as a rollback attack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ManifestMetadata {
    #[serde(rename = "lastSyncedManifestVersion")]
    pub last_synced_manifest_version: u64,
    #[serde(rename = "lastSyncedETag", default, skip_serializing_if = "Option::is_none")]
    pub last_synced_etag: Option<String>,
    #[serde(rename = "lastSyncedBundleDigest", default, skip_serializing_if = "Option::is_none")]
    pub last_synced_bundle_digest: Option<Digest>,
}

// ── Deployment record ─────────────────────────────────────────────────────────

/// The store's unit of state for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    #[serde(rename = "deploymentId")]
    pub deployment_id: DeploymentId,
    /// Last manifest received from the fleet manager, or absent.
    #[serde(rename = "desiredState", default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<AppDeployment>,
    /// Last fully-applied manifest, or absent if never converged.
    #[serde(rename = "currentState", default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<AppDeployment>,
    #[serde(rename = "componentStatus", default)]
    pub component_status: BTreeMap<String, ComponentStatus>,
    pub phase: DeploymentPhase,
    /// Human-readable last-transition reason.
    #[serde(default)]
    pub message: String,
    /// Content digest of the manifest that produced `desired_state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(deployment_id: DeploymentId, now: DateTime<Utc>) -> Self {
        Self {
            deployment_id,
            desired_state: None,
            current_state: None,
            component_status: BTreeMap::new(),
            phase: DeploymentPhase::Pending,
            message: String::new(),
            digest: None,
            last_updated: now,
        }
    }

    /// True iff desired and current diverge: a removal is requested, nothing
    /// has been applied yet, or the applied spec no longer matches the
    /// desired one.
    pub fn needs_reconciliation(&self) -> bool {
        let Some(desired) = &self.desired_state else {
            return false;
        };
        if desired.state == TargetState::Removing {
            return true;
        }
        match &self.current_state {
            None => true,
            Some(current) => desired != current,
        }
    }

    /// Flattened wire view of this record, synthesizing from desired state
    /// when nothing has been applied yet.
    pub fn to_app_state(&self) -> Option<AppState> {
        self.current_state
            .as_ref()
            .or(self.desired_state.as_ref())
            .map(|d| d.to_app_state(self.digest.clone(), self.phase))
    }
}
