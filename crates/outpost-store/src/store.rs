use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outpost_domain::{
    AppDeployment, AppState, ComponentState, ComponentStatus, DeploymentId, DeploymentPhase,
    DeploymentRecord, DeviceIdentity, Digest, ManifestMetadata,
};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::events::{StoreEvent, Subscriber, SubscriberSet};
use crate::persist::{load_state, write_state_atomic, PersistedState};

/// Write bursts are coalesced for this long before hitting the disk.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);
/// Periodic flush interval, covering dirty state whose debounce was lost.
const PERIODIC_FLUSH: Duration = Duration::from_secs(30);

/// Durable mapping from deployment id to [`DeploymentRecord`], plus the
/// device identity and manifest metadata singletons.
///
/// The store exclusively owns record memory: readers get clones, subscribers
/// get an immutable snapshot per event, and every mutation goes through one
/// of the operations below. Events for a single id are published in write
/// order and dispatched off the mutator's task.
pub struct Store {
    inner: RwLock<PersistedState>,
    subscribers: SubscriberSet,
    path: PathBuf,
    dirty: AtomicBool,
    flush_requested: Notify,
    persist_healthy: AtomicBool,
}

impl Store {
    /// Open the store backed by `path`. The file, if present, is loaded
    /// before anything else runs; a missing file starts empty.
    pub fn open(path: &Path) -> Arc<Store> {
        let state = load_state(path);
        info!(
            path = %path.display(),
            deployments = state.deployments.len(),
            "state store opened"
        );
        Arc::new(Store {
            inner: RwLock::new(state),
            subscribers: SubscriberSet::default(),
            path: path.to_path_buf(),
            dirty: AtomicBool::new(false),
            flush_requested: Notify::new(),
            persist_healthy: AtomicBool::new(true),
        })
    }

    // ── Deployment records ────────────────────────────────────────────────────

    /// Create or update the desired state for `id`. A record is created with
    /// `PENDING` phase if absent. Re-applying the same digest is a no-op and
    /// emits nothing.
    pub async fn upsert_desired_state(
        &self,
        id: DeploymentId,
        desired: AppDeployment,
        digest: Digest,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .deployments
            .entry(id)
            .or_insert_with(|| DeploymentRecord::new(id, Utc::now()));

        if record.digest.as_ref() == Some(&digest) {
            debug!(deployment_id = %id, digest = %digest, "desired state unchanged; skipping");
            return Ok(());
        }

        record.desired_state = Some(desired);
        record.digest = Some(digest);
        record.last_updated = Utc::now();
        let event = StoreEvent::DesiredStateSet { record: record.clone() };
        self.mark_dirty_and_publish(event);
        Ok(())
    }

    /// Record the manifest the agent has fully applied.
    pub async fn set_current_state(
        &self,
        id: DeploymentId,
        current: AppDeployment,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::DeploymentNotFound(id))?;
        record.current_state = Some(current);
        record.last_updated = Utc::now();
        let event = StoreEvent::CurrentStateSet { record: record.clone() };
        self.mark_dirty_and_publish(event);
        Ok(())
    }

    /// Set phase and transition message. Creates a stub record for an unknown
    /// id so integrity failures seen before the first upsert are
    /// representable. Identical phase+message is a no-op.
    pub async fn set_phase(
        &self,
        id: DeploymentId,
        phase: DeploymentPhase,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        let message = message.into();
        let mut guard = self.inner.write().await;
        let record = guard
            .deployments
            .entry(id)
            .or_insert_with(|| DeploymentRecord::new(id, Utc::now()));

        if record.phase == phase && record.message == message {
            return Ok(());
        }
        record.phase = phase;
        record.message = message;
        record.last_updated = Utc::now();
        let event = StoreEvent::PhaseChanged { record: record.clone() };
        self.mark_dirty_and_publish(event);
        Ok(())
    }

    /// Update one component's status. If the aggregate implies a phase change
    /// (all `INSTALLED` → `RUNNING`, any `FAILED` → `FAILED`), the phase
    /// transition is applied and published as a `PHASE_CHANGED` event.
    pub async fn set_component_status(
        &self,
        id: DeploymentId,
        component: &str,
        status: ComponentStatus,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::DeploymentNotFound(id))?;

        if record.component_status.get(component) == Some(&status) {
            return Ok(());
        }
        record.component_status.insert(component.to_string(), status);
        record.last_updated = Utc::now();

        // Removal phases are driven by the reconciler; observations of
        // components being torn down must not drag the phase back.
        let implied = match record.phase {
            DeploymentPhase::Removing | DeploymentPhase::Removed => None,
            _ => implied_phase(record),
        };

        let event = match implied {
            Some((phase, message)) if phase != record.phase => {
                record.phase = phase;
                record.message = message;
                Some(StoreEvent::PhaseChanged { record: record.clone() })
            }
            _ => None,
        };

        self.dirty.store(true, Ordering::SeqCst);
        self.flush_requested.notify_one();
        if let Some(event) = event {
            self.subscribers.publish(&event);
        }
        Ok(())
    }

    /// Delete the record. Deleting an unknown id is a no-op.
    pub async fn remove(&self, id: DeploymentId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.deployments.remove(&id).is_some() {
            let event = StoreEvent::RecordDeleted { deployment_id: id };
            self.mark_dirty_and_publish(event);
        }
        Ok(())
    }

    pub async fn get(&self, id: DeploymentId) -> Option<DeploymentRecord> {
        self.inner.read().await.deployments.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<DeploymentRecord> {
        self.inner.read().await.deployments.values().cloned().collect()
    }

    /// True iff desired and current diverge along a digest or app-state
    /// comparison. The single predicate the reconciler triggers on.
    pub async fn needs_reconciliation(&self, id: DeploymentId) -> bool {
        self.inner
            .read()
            .await
            .deployments
            .get(&id)
            .map(DeploymentRecord::needs_reconciliation)
            .unwrap_or(false)
    }

    /// Flattened wire view of every record, for the sync call.
    pub async fn app_states(&self) -> Vec<AppState> {
        self.inner
            .read()
            .await
            .deployments
            .values()
            .filter_map(DeploymentRecord::to_app_state)
            .collect()
    }

    // ── Device identity and manifest metadata ─────────────────────────────────

    pub async fn upsert_device_identity(&self, identity: DeviceIdentity) {
        let mut guard = self.inner.write().await;
        guard.identity = Some(identity);
        self.dirty.store(true, Ordering::SeqCst);
        self.flush_requested.notify_one();
    }

    pub async fn get_device_identity(&self) -> Option<DeviceIdentity> {
        self.inner.read().await.identity.clone()
    }

    pub async fn upsert_manifest_metadata(&self, meta: ManifestMetadata) {
        let mut guard = self.inner.write().await;
        guard.manifest = meta;
        self.dirty.store(true, Ordering::SeqCst);
        self.flush_requested.notify_one();
    }

    pub async fn get_manifest_metadata(&self) -> ManifestMetadata {
        self.inner.read().await.manifest.clone()
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.unsubscribe(id);
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Serialize the full state to disk via write-temp-then-rename.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let guard = self.inner.read().await;
        let result = write_state_atomic(&self.path, &guard);
        drop(guard);
        match &result {
            Ok(()) => {
                self.persist_healthy.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                self.persist_healthy.store(false, Ordering::SeqCst);
                warn!(path = %self.path.display(), error = %e, "state flush failed; will retry");
            }
        }
        result
    }

    /// False while the last flush attempt failed. Service continues either
    /// way; this is surfaced as an operator health signal.
    pub fn healthy(&self) -> bool {
        self.persist_healthy.load(Ordering::SeqCst)
    }

    async fn flush_if_dirty(&self) {
        if self.dirty.swap(false, Ordering::SeqCst) && self.flush().await.is_err() {
            // keep the dirty mark so the next tick retries
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Background task that coalesces write bursts with a short debounce and
    /// also flushes periodically. Flushes once more on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERIODIC_FLUSH);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first interval tick fires immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = store.flush_requested.notified() => {
                        tokio::time::sleep(FLUSH_DEBOUNCE).await;
                        store.flush_if_dirty().await;
                    }
                    _ = ticker.tick() => {
                        store.flush_if_dirty().await;
                    }
                    _ = shutdown.cancelled() => {
                        store.flush_if_dirty().await;
                        debug!("store flusher stopped");
                        return;
                    }
                }
            }
        })
    }

    fn mark_dirty_and_publish(&self, event: StoreEvent) {
        self.dirty.store(true, Ordering::SeqCst);
        self.flush_requested.notify_one();
        self.subscribers.publish(&event);
    }
}

/// Phase implied by the component aggregate, with its transition message.
fn implied_phase(record: &DeploymentRecord) -> Option<(DeploymentPhase, String)> {
    if record.component_status.is_empty() {
        return None;
    }
    if let Some((name, status)) = record
        .component_status
        .iter()
        .find(|(_, s)| s.state == ComponentState::Failed)
    {
        let message = match &status.error {
            Some(err) => format!("component {} failed: {}", name, err),
            None => format!("component {} failed", name),
        };
        return Some((DeploymentPhase::Failed, message));
    }
    if record
        .component_status
        .values()
        .all(|s| s.state == ComponentState::Installed)
    {
        return Some((DeploymentPhase::Running, "all components installed".into()));
    }
    None
}
