use std::collections::BTreeMap;
use std::path::Path;

use outpost_domain::{DeploymentId, DeploymentRecord, DeviceIdentity, ManifestMetadata};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// The entire durable image of the store: deployment map, device identity and
/// manifest metadata, serialized as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub deployments: BTreeMap<DeploymentId, DeploymentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<DeviceIdentity>,
    #[serde(default)]
    pub manifest: ManifestMetadata,
}

/// Load the state file. A missing file starts empty; an unparseable file is
/// reset to empty with a warning (no automatic corruption recovery).
pub fn load_state(path: &Path) -> PersistedState {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return PersistedState::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state file; starting empty");
            return PersistedState::default();
        }
    };
    match serde_json::from_slice(&content) {
        Ok(state) => state,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "state file is not valid JSON; resetting to empty"
            );
            PersistedState::default()
        }
    }
}

/// Write the state file atomically: serialize to `<path>.tmp`, then rename
/// over the target. The on-disk image is always one of two consistent
/// snapshots.
pub fn write_state_atomic(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
    let io_err = |p: &Path, source: std::io::Error| StoreError::Io {
        path: p.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let bytes = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outpost_domain::DeploymentPhase;
    use uuid::Uuid;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state(&dir.path().join("state.json"));
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn corrupt_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let state = load_state(&path);
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let id = DeploymentId::new(Uuid::new_v4());
        let mut rec = DeploymentRecord::new(id, Utc::now());
        rec.phase = DeploymentPhase::Running;
        rec.message = "converged".into();

        let mut state = PersistedState::default();
        state.deployments.insert(id, rec);
        state.manifest.last_synced_manifest_version = 7;
        state.manifest.last_synced_etag = Some("\"abc\"".into());

        write_state_atomic(&path, &state).unwrap();
        let loaded = load_state(&path);
        assert_eq!(loaded, state);
        // no leftover temp file
        assert!(!path.with_extension("json.tmp").exists());
    }
}
