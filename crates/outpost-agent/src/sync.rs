use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use outpost_domain::{DeploymentId, DeploymentPhase, Digest, ManifestMetadata, TargetState};
use outpost_store::Store;
use outpost_wfm::{
    extract_bundle, parse_deployment, verify_digest, BundleRef, DeploymentRef, SyncOutcome,
    UnsignedAppStateManifest, WfmClient, WfmError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;

/// The state seeker: source-of-truth for desired deployments.
///
/// One sync cycle pulls the manifest (with ETag caching), validates version
/// monotonicity, marks removals, retrieves and digest-verifies per-deployment
/// YAMLs (bundled or individual), and upserts desired states. A failed cycle
/// is logged and retried on the next tick; it never stops the scheduler.
pub struct SyncLoop {
    pub store: Arc<Store>,
    pub client: Arc<WfmClient>,
    pub device_id: String,
    pub interval: Duration,
    pub cycle_timeout: Duration,
    pub bundle_deployment_threshold: usize,
    pub bundle_size_cap_bytes: u64,
}

impl SyncLoop {
    /// Run cycles forever: one immediately at startup, then on the interval.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(self.cycle_timeout, self.run_cycle()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => match e {
                        AgentError::Wfm(WfmError::Integrity(msg)) => {
                            error!(kind = "Integrity", "sync cycle rejected: {}", msg)
                        }
                        other => warn!(error = %other, "sync cycle failed"),
                    },
                    Err(_) => warn!(
                        timeout_secs = self.cycle_timeout.as_secs(),
                        "sync cycle abandoned after timeout"
                    ),
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = cancel.cancelled() => {
                        debug!("sync loop stopped");
                        return;
                    }
                }
            }
        })
    }

    /// One sync cycle. Any integrity rejection happens before the first
    /// store mutation.
    pub async fn run_cycle(&self) -> Result<(), AgentError> {
        let meta = self.store.get_manifest_metadata().await;
        let states = self.store.app_states().await;

        let outcome = self
            .client
            .sync_state(&self.device_id, meta.last_synced_etag.as_deref(), &states)
            .await?;

        let (manifest, etag) = match outcome {
            SyncOutcome::NotModified => return Ok(()),
            SyncOutcome::Manifest { manifest, etag } => (manifest, etag),
        };

        let version = validate_version(&manifest, meta.last_synced_manifest_version)?;

        // Detect removals: anything we hold that the manifest no longer lists.
        let manifest_ids: HashSet<DeploymentId> =
            manifest.deployments.iter().map(|d| d.deployment_id).collect();
        for record in self.store.list().await {
            if manifest_ids.contains(&record.deployment_id) {
                continue;
            }
            match record.desired_state.as_ref().or(record.current_state.as_ref()) {
                Some(state) => {
                    let mut removing = state.clone();
                    removing.state = TargetState::Removing;
                    let digest = Digest::of_canonical_json(&removing);
                    info!(deployment_id = %record.deployment_id, "marking deployment for removal");
                    self.store
                        .upsert_desired_state(record.deployment_id, removing, digest)
                        .await?;
                }
                None => {
                    // stub record (e.g. an early integrity failure); nothing
                    // to uninstall
                    self.store.remove(record.deployment_id).await?;
                }
            }
        }

        // The same id listed twice: last occurrence wins.
        let refs = dedupe_last_wins(&manifest.deployments);

        match manifest.bundle.as_ref() {
            Some(bundle)
                if use_bundle(
                    refs.len(),
                    Some(bundle),
                    self.bundle_deployment_threshold,
                    self.bundle_size_cap_bytes,
                ) =>
            {
                self.apply_from_bundle(&refs, bundle).await?;
            }
            _ => {
                for dep_ref in &refs {
                    match self
                        .client
                        .fetch_deployment(&self.device_id, dep_ref.deployment_id, &dep_ref.digest)
                        .await
                    {
                        Ok(bytes) => self.apply_deployment(dep_ref, &bytes).await?,
                        Err(e) => {
                            warn!(deployment_id = %dep_ref.deployment_id, error = %e, "deployment fetch failed");
                            self.store
                                .set_phase(
                                    dep_ref.deployment_id,
                                    DeploymentPhase::Failed,
                                    format!("deployment fetch failed: {}", e),
                                )
                                .await?;
                        }
                    }
                }
            }
        }

        // ETag from the response header, or a locally computed one so the
        // next cycle can still short-circuit.
        let etag = etag.unwrap_or_else(|| local_etag(&manifest));
        self.store
            .upsert_manifest_metadata(ManifestMetadata {
                last_synced_manifest_version: version,
                last_synced_etag: Some(etag),
                last_synced_bundle_digest: manifest.bundle.map(|b| b.digest),
            })
            .await;

        Ok(())
    }

    async fn apply_from_bundle(
        &self,
        refs: &[DeploymentRef],
        bundle: &BundleRef,
    ) -> Result<(), AgentError> {
        info!(digest = %bundle.digest, "downloading deployment bundle");
        let bytes = self.client.fetch_bundle(&self.device_id, &bundle.digest).await?;
        // a corrupt bundle rejects the whole cycle
        verify_digest(&bytes, &bundle.digest)?;
        let entries = extract_bundle(&bytes)?;

        for dep_ref in refs {
            match entries.get(&dep_ref.deployment_id) {
                Some(content) => self.apply_deployment(dep_ref, content).await?,
                None => {
                    warn!(deployment_id = %dep_ref.deployment_id, "deployment missing from bundle");
                    self.store
                        .set_phase(
                            dep_ref.deployment_id,
                            DeploymentPhase::Failed,
                            "deployment yaml missing from bundle",
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Verify and upsert one deployment. Digest mismatches and manifest
    /// errors mark the deployment `FAILED` and never abort the cycle.
    async fn apply_deployment(
        &self,
        dep_ref: &DeploymentRef,
        bytes: &[u8],
    ) -> Result<(), AgentError> {
        if let Err(e) = verify_digest(bytes, &dep_ref.digest) {
            warn!(deployment_id = %dep_ref.deployment_id, error = %e, "digest verification failed");
            self.store
                .set_phase(
                    dep_ref.deployment_id,
                    DeploymentPhase::Failed,
                    format!("digest verification failed: {}", e),
                )
                .await?;
            return Ok(());
        }

        let deployment = match parse_deployment(bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(deployment_id = %dep_ref.deployment_id, error = %e, "unusable deployment yaml");
                self.store
                    .set_phase(dep_ref.deployment_id, DeploymentPhase::Failed, e.to_string())
                    .await?;
                return Ok(());
            }
        };

        if deployment.deployment_id != dep_ref.deployment_id {
            self.store
                .set_phase(
                    dep_ref.deployment_id,
                    DeploymentPhase::Failed,
                    format!(
                        "deployment yaml declares id {} but the manifest references {}",
                        deployment.deployment_id, dep_ref.deployment_id
                    ),
                )
                .await?;
            return Ok(());
        }

        self.store
            .upsert_desired_state(dep_ref.deployment_id, deployment, dep_ref.digest.clone())
            .await?;
        Ok(())
    }
}

/// Reject an unset version, and a lower one as a rollback attack. Equal
/// versions are permitted (idempotent resend).
fn validate_version(
    manifest: &UnsignedAppStateManifest,
    last_synced: u64,
) -> Result<u64, WfmError> {
    let version = manifest
        .manifest_version
        .ok_or_else(|| WfmError::Integrity("manifest has no manifestVersion".into()))?;
    if version < last_synced {
        return Err(WfmError::Integrity(format!(
            "manifest version regressed from {} to {} (rollback rejected)",
            last_synced, version
        )));
    }
    Ok(version)
}

/// Bundle retrieval is worthwhile when the manifest references one and either
/// the deployment count exceeds the threshold or the declared size is below
/// the cap. An undeclared size only qualifies through the count.
fn use_bundle(
    deployment_count: usize,
    bundle: Option<&BundleRef>,
    threshold: usize,
    size_cap: u64,
) -> bool {
    let Some(bundle) = bundle else { return false };
    deployment_count > threshold || bundle.size_bytes.is_some_and(|s| s < size_cap)
}

fn dedupe_last_wins(refs: &[DeploymentRef]) -> Vec<DeploymentRef> {
    let mut by_id: HashMap<DeploymentId, DeploymentRef> = HashMap::new();
    let mut order: Vec<DeploymentId> = Vec::new();
    for r in refs {
        if by_id.insert(r.deployment_id, r.clone()).is_none() {
            order.push(r.deployment_id);
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

/// Fallback ETag when the server does not send one: a digest over the
/// canonical manifest JSON.
fn local_etag(manifest: &UnsignedAppStateManifest) -> String {
    format!("\"{}\"", Digest::of_canonical_json(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep_ref(id: &str, payload: &[u8]) -> DeploymentRef {
        DeploymentRef {
            deployment_id: DeploymentId::parse(id).unwrap(),
            digest: Digest::sha256(payload),
            url: format!("https://fm.example/d/{}", id),
        }
    }

    #[test]
    fn version_validation_rejects_unset_and_regression() {
        let mut manifest = UnsignedAppStateManifest {
            manifest_version: None,
            deployments: vec![],
            bundle: None,
        };
        assert!(matches!(
            validate_version(&manifest, 0).unwrap_err(),
            WfmError::Integrity(_)
        ));

        manifest.manifest_version = Some(4);
        assert!(validate_version(&manifest, 5).is_err());
        // equal versions are an idempotent resend
        assert_eq!(validate_version(&manifest, 4).unwrap(), 4);
        assert_eq!(validate_version(&manifest, 3).unwrap(), 4);
    }

    #[test]
    fn bundle_choice_follows_count_and_size() {
        let bundle = BundleRef {
            digest: Digest::sha256(b"bundle"),
            size_bytes: Some(10 * 1024 * 1024),
        };
        let cap = 50 * 1024 * 1024;

        // no bundle referenced: never
        assert!(!use_bundle(10, None, 2, cap));
        // count above threshold
        assert!(use_bundle(3, Some(&bundle), 2, cap));
        // small bundle qualifies even with a low count
        assert!(use_bundle(1, Some(&bundle), 2, cap));

        let huge = BundleRef {
            digest: Digest::sha256(b"bundle"),
            size_bytes: Some(cap + 1),
        };
        assert!(!use_bundle(1, Some(&huge), 2, cap));

        let undeclared = BundleRef { digest: Digest::sha256(b"bundle"), size_bytes: None };
        assert!(!use_bundle(1, Some(&undeclared), 2, cap));
        assert!(use_bundle(3, Some(&undeclared), 2, cap));
    }

    #[test]
    fn duplicate_ids_keep_the_last_occurrence() {
        let a1 = dep_ref("11111111-1111-1111-1111-111111111111", b"v1");
        let a2 = dep_ref("11111111-1111-1111-1111-111111111111", b"v2");
        let b = dep_ref("22222222-2222-2222-2222-222222222222", b"x");

        let deduped = dedupe_last_wins(&[a1.clone(), b.clone(), a2.clone()]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].digest, a2.digest);
        assert_eq!(deduped[1].deployment_id, b.deployment_id);
    }

    #[test]
    fn local_etag_is_stable_per_manifest() {
        let manifest = UnsignedAppStateManifest {
            manifest_version: Some(1),
            deployments: vec![dep_ref("11111111-1111-1111-1111-111111111111", b"v1")],
            bundle: None,
        };
        assert_eq!(local_etag(&manifest), local_etag(&manifest.clone()));
    }
}
