use outpost_config::CapabilitiesConfig;
use outpost_wfm::WfmClient;
use tracing::{debug, info, warn};

/// Read the local capabilities descriptor and post it to the fleet manager.
///
/// Capability reporting is advisory: every failure here is a warning, and the
/// sync loop starts regardless.
pub async fn report_capabilities(
    client: &WfmClient,
    device_id: &str,
    config: &CapabilitiesConfig,
) {
    let Some(path) = &config.read_from_file else {
        debug!("no capabilities file configured; skipping report");
        return;
    };

    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read capabilities file");
            return;
        }
    };
    let capabilities: serde_json::Value = match serde_json::from_slice(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "capabilities file is not valid JSON");
            return;
        }
    };

    // the descriptor is opaque to the agent except for its id
    let descriptor_id = capabilities["properties"]["id"].as_str().unwrap_or("<unset>");

    match client.post_capabilities(device_id, &capabilities).await {
        Ok(()) => info!(descriptor_id, "capabilities reported"),
        Err(e) => warn!(descriptor_id, error = %e, "capabilities report failed (non-fatal)"),
    }
}
