use std::collections::BTreeMap;

use outpost_domain::{
    AppDeployment, ComponentSpec, ComposeComponent, DeploymentId, DeploymentProfile,
    DeploymentProfileType, HelmComponent, TargetState,
};
use serde::Deserialize;

use crate::error::WfmError;

// ── Raw YAML shape ────────────────────────────────────────────────────────────

// apiVersion and kind are accepted but not inspected
#[derive(Debug, Deserialize)]
struct RawAppDeployment {
    metadata: RawMetadata,
    spec: RawSpec,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    state: Option<String>,
    #[serde(rename = "deploymentProfile")]
    deployment_profile: RawProfile,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(rename = "type")]
    profile_type: String,
    #[serde(default)]
    components: Vec<RawComponent>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    name: String,
    #[serde(default)]
    properties: RawProperties,
}

#[derive(Debug, Deserialize, Default)]
struct RawProperties {
    repository: Option<String>,
    revision: Option<String>,
    wait: Option<bool>,
    #[serde(rename = "packageLocation")]
    package_location: Option<String>,
    #[serde(rename = "keyLocation")]
    key_location: Option<String>,
}

// ── Conversion ────────────────────────────────────────────────────────────────

/// Parse one deployment YAML into the domain model.
///
/// Every failure path (bad YAML, unknown profile type, missing component
/// properties) is a [`WfmError::Manifest`] the sync loop records as a
/// `FAILED` deployment rather than a crashed cycle.
pub fn parse_deployment(yaml: &[u8]) -> Result<AppDeployment, WfmError> {
    let raw: RawAppDeployment = serde_yaml::from_slice(yaml)
        .map_err(|e| WfmError::Manifest(format!("deployment yaml parse: {}", e)))?;

    let deployment_id = DeploymentId::parse(&raw.metadata.id)
        .map_err(|e| WfmError::Manifest(e.to_string()))?;

    let profile_type = DeploymentProfileType::parse(&raw.spec.deployment_profile.profile_type)
        .map_err(|e| WfmError::Manifest(e.to_string()))?;

    let state = match raw.spec.state.as_deref() {
        None | Some("RUNNING") => TargetState::Running,
        Some("REMOVING") => TargetState::Removing,
        Some(other) => {
            return Err(WfmError::Manifest(format!("unknown desired state '{}'", other)))
        }
    };

    if raw.spec.deployment_profile.components.is_empty() {
        return Err(WfmError::Manifest(format!(
            "deployment {} has no components",
            deployment_id
        )));
    }

    let components = raw
        .spec
        .deployment_profile
        .components
        .into_iter()
        .map(|c| convert_component(c, profile_type))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AppDeployment {
        deployment_id,
        name: raw.metadata.name.unwrap_or_else(|| deployment_id.to_string()),
        state,
        profile: DeploymentProfile { profile_type, components },
        parameters: raw.spec.parameters,
    })
}

fn convert_component(
    raw: RawComponent,
    profile: DeploymentProfileType,
) -> Result<ComponentSpec, WfmError> {
    match profile {
        DeploymentProfileType::HelmV3 => {
            let repository = raw.properties.repository.ok_or_else(|| {
                WfmError::Manifest(format!("helm component '{}' is missing repository", raw.name))
            })?;
            Ok(ComponentSpec::Helm(HelmComponent {
                name: raw.name,
                repository,
                revision: raw.properties.revision,
                wait: raw.properties.wait,
            }))
        }
        DeploymentProfileType::Compose => {
            let package_location = raw.properties.package_location.ok_or_else(|| {
                WfmError::Manifest(format!(
                    "compose component '{}' is missing packageLocation",
                    raw.name
                ))
            })?;
            Ok(ComponentSpec::Compose(ComposeComponent {
                name: raw.name,
                package_location,
                key_location: raw.properties.key_location,
            }))
        }
    }
}
