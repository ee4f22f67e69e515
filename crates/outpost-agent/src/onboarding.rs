use std::sync::Arc;
use std::time::Duration;

use outpost_config::AgentConfig;
use outpost_domain::{DeviceIdentity, OnboardingState};
use outpost_store::Store;
use outpost_wfm::{WfmClient, WfmError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AgentError;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Ensure the device has a usable identity before anything else starts.
///
/// State machine: `UNINITIALIZED → IN-PROGRESS → ONBOARDED | FAILED`. A
/// stored `ONBOARDED` identity short-circuits. Otherwise the onboarding
/// endpoint is retried with a fixed delay up to the configured cap; a missing
/// signature file is fatal immediately. Returns the device client id.
pub async fn ensure_onboarded(
    store: &Arc<Store>,
    client: &WfmClient,
    config: &AgentConfig,
    cancel: &CancellationToken,
) -> Result<String, AgentError> {
    if let Some(identity) = store.get_device_identity().await {
        if identity.state == OnboardingState::Onboarded {
            info!(device_client_id = %identity.device_client_id, "device already onboarded");
            return Ok(identity.device_client_id);
        }
    }

    let signature_path = &config.onboarding.signature_file;
    let signature = std::fs::read_to_string(signature_path)
        .map(|s| s.trim().to_string())
        .map_err(|e| AgentError::SignatureFile {
            path: signature_path.display().to_string(),
            source: e,
        })?;

    // Provisional id: config, then any previously persisted id, then a fresh
    // UUID. The fleet manager may replace it with its own client id.
    let provisional_id = match &config.device_id {
        Some(id) => id.clone(),
        None => match store.get_device_identity().await {
            Some(identity) => identity.device_client_id,
            None => Uuid::new_v4().to_string(),
        },
    };

    store
        .upsert_device_identity(DeviceIdentity {
            device_client_id: provisional_id.clone(),
            device_signature: signature.clone(),
            auth_enabled: false,
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_token_url: None,
            state: OnboardingState::InProgress,
        })
        .await;

    let max_attempts = config.onboarding.max_attempts;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let result = tokio::time::timeout(
            config.timeouts.onboard_attempt,
            client.onboard_device(&provisional_id, &signature),
        )
        .await;

        match result {
            Ok(Ok(resp)) => {
                let auth_enabled =
                    resp.client_secret.is_some() && resp.token_endpoint_url.is_some();
                let identity = DeviceIdentity {
                    device_client_id: resp.client_id.clone(),
                    device_signature: signature,
                    auth_enabled,
                    oauth_client_id: auth_enabled.then(|| resp.client_id.clone()),
                    oauth_client_secret: resp.client_secret,
                    oauth_token_url: resp.token_endpoint_url,
                    state: OnboardingState::Onboarded,
                };
                store.upsert_device_identity(identity).await;
                info!(device_client_id = %resp.client_id, auth_enabled, "device onboarded");
                return Ok(resp.client_id);
            }
            Ok(Err(e)) => {
                let kind = match &e {
                    WfmError::Auth(_) => "AUTH",
                    WfmError::Transport(_) => "TRANSPORT",
                    _ => "PROTOCOL",
                };
                warn!(attempt, max_attempts, kind, error = %e, "onboarding attempt failed");
                last_error = e.to_string();
            }
            Err(_) => {
                warn!(attempt, max_attempts, "onboarding attempt timed out");
                last_error = "attempt timed out".to_string();
            }
        }

        if attempt < max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = cancel.cancelled() => return Err(AgentError::ShuttingDown),
            }
        }
    }

    if let Some(mut identity) = store.get_device_identity().await {
        identity.state = OnboardingState::Failed;
        store.upsert_device_identity(identity).await;
    }
    Err(AgentError::OnboardingExhausted {
        attempts: max_attempts,
        last_error,
    })
}
