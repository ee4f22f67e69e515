use outpost_domain::{
    AppState, ComponentState, DeploymentId, DeploymentPhase, DeploymentRecord, Digest,
};
use serde::{Deserialize, Serialize};

// ── Onboarding ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingRequest {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceSignature")]
    pub device_signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingResponse {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret", default)]
    pub client_secret: Option<String>,
    #[serde(rename = "tokenEndpointUrl", default)]
    pub token_endpoint_url: Option<String>,
}

// ── Manifest ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRef {
    #[serde(rename = "deploymentId")]
    pub deployment_id: DeploymentId,
    pub digest: Digest,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub digest: Digest,
    #[serde(rename = "sizeBytes", default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Desired-state manifest returned by one sync call.
/// `manifestVersion` is optional on the wire; an unset version is rejected
/// during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedAppStateManifest {
    #[serde(rename = "manifestVersion", default, skip_serializing_if = "Option::is_none")]
    pub manifest_version: Option<u64>,
    #[serde(default)]
    pub deployments: Vec<DeploymentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleRef>,
}

/// Result of one sync call against the fleet manager.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    NotModified,
    Manifest {
        manifest: UnsignedAppStateManifest,
        etag: Option<String>,
    },
}

// ── Status reporting ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatusReport {
    pub name: String,
    pub state: ComponentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Observed state of one deployment, posted to the fleet manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatus {
    #[serde(rename = "deploymentId")]
    pub deployment_id: DeploymentId,
    /// Overall state, projected from the record's phase.
    pub state: DeploymentPhase,
    pub components: Vec<ComponentStatusReport>,
    /// The applied app state; synthesized from the desired state when nothing
    /// has been applied yet so the fleet manager still sees failures.
    #[serde(rename = "appState", default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<AppState>,
}

impl DeploymentStatus {
    pub fn from_record(record: &DeploymentRecord) -> Self {
        DeploymentStatus {
            deployment_id: record.deployment_id,
            state: record.phase,
            components: record
                .component_status
                .iter()
                .map(|(name, status)| ComponentStatusReport {
                    name: name.clone(),
                    state: status.state,
                    error: status.error.clone(),
                })
                .collect(),
            app_state: record.to_app_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outpost_domain::ComponentStatus;
    use uuid::Uuid;

    #[test]
    fn manifest_with_missing_version_deserializes_as_unset() {
        let manifest: UnsignedAppStateManifest =
            serde_json::from_str(r#"{"deployments":[]}"#).unwrap();
        assert!(manifest.manifest_version.is_none());
        assert!(manifest.deployments.is_empty());
        assert!(manifest.bundle.is_none());
    }

    #[test]
    fn status_from_record_synthesizes_app_state_from_desired() {
        let id = DeploymentId::new(Uuid::new_v4());
        let mut record = DeploymentRecord::new(id, Utc::now());
        record.phase = DeploymentPhase::Failed;
        record.message = "digest mismatch".into();
        record
            .component_status
            .insert("web".into(), ComponentStatus::failed("pull error"));

        // no desired or current: nothing to synthesize from
        let status = DeploymentStatus::from_record(&record);
        assert_eq!(status.state, DeploymentPhase::Failed);
        assert!(status.app_state.is_none());
        assert_eq!(status.components.len(), 1);
        assert_eq!(status.components[0].name, "web");
        assert_eq!(status.components[0].error.as_deref(), Some("pull error"));
    }
}
