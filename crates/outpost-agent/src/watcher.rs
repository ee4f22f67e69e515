use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use outpost_domain::{ComponentState, ComponentStatus, DeploymentId};
use outpost_runtime::RuntimeRegistry;
use outpost_store::{Store, StoreEvent, Subscriber};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The workload monitor supervisor: one cancellable poll task per active
/// deployment, translating runtime-specific status into canonical component
/// status writes. The watcher observes reality and never talks to the
/// reconciler directly; all communication goes through the store.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    registry: Arc<RuntimeRegistry>,
    poll_interval: Duration,
    probe_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<DeploymentId, CancellationToken>>,
}

impl Watcher {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<RuntimeRegistry>,
        poll_interval: Duration,
        probe_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                poll_interval,
                probe_timeout,
                cancel,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a background observer for `id`. Idempotent.
    pub fn watch(&self, id: DeploymentId) {
        let mut tasks = self.inner.tasks.lock().expect("watch task map poisoned");
        if tasks.contains_key(&id) {
            return;
        }
        let token = self.inner.cancel.child_token();
        tasks.insert(id, token.clone());
        debug!(deployment_id = %id, "starting workload monitor");
        tokio::spawn(poll_loop(Arc::clone(&self.inner), id, token));
    }

    /// Stop the observer for `id`, if any.
    pub fn stop_watching(&self, id: DeploymentId) {
        if let Some(token) = self
            .inner
            .tasks
            .lock()
            .expect("watch task map poisoned")
            .remove(&id)
        {
            debug!(deployment_id = %id, "stopping workload monitor");
            token.cancel();
        }
    }

    /// Restart monitors for everything already in the store (process start).
    pub async fn resume(&self) {
        for record in self.inner.store.list().await {
            if record.desired_state.is_some() || record.current_state.is_some() {
                self.watch(record.deployment_id);
            }
        }
    }
}

#[async_trait]
impl Subscriber for Watcher {
    fn id(&self) -> &str {
        "watcher"
    }

    async fn on_event(
        &self,
        event: &StoreEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match event {
            StoreEvent::DesiredStateSet { record } => self.watch(record.deployment_id),
            StoreEvent::RecordDeleted { deployment_id } => self.stop_watching(*deployment_id),
            _ => {}
        }
        Ok(())
    }
}

async fn poll_loop(inner: Arc<Inner>, id: DeploymentId, token: CancellationToken) {
    loop {
        poll_once(&inner, id).await;
        tokio::select! {
            _ = tokio::time::sleep(inner.poll_interval) => {}
            _ = token.cancelled() => {
                debug!(deployment_id = %id, "workload monitor stopped");
                return;
            }
        }
    }
}

/// One poll: probe the runtime and write each observation back. Probe
/// failures are logged and skipped; the next tick retries. A probe failure
/// is not a workload failure.
async fn poll_once(inner: &Inner, id: DeploymentId) {
    let Some(record) = inner.store.get(id).await else {
        return;
    };
    // prefer what was applied; fall back to desired during first install
    let Some(deployment) = record.current_state.as_ref().or(record.desired_state.as_ref())
    else {
        return;
    };

    let monitor = match inner.registry.monitor_for(deployment.profile.profile_type) {
        Ok(m) => m,
        Err(e) => {
            debug!(deployment_id = %id, error = %e, "no monitor for profile");
            return;
        }
    };

    let observations =
        match tokio::time::timeout(inner.probe_timeout, monitor.status(deployment)).await {
            Ok(Ok(obs)) => obs,
            Ok(Err(e)) => {
                debug!(deployment_id = %id, error = %e, "status probe failed; will retry");
                return;
            }
            Err(_) => {
                debug!(deployment_id = %id, "status probe timed out; will retry");
                return;
            }
        };

    for obs in observations {
        let status = ComponentStatus {
            state: obs.state,
            error: (obs.state == ComponentState::Failed).then(|| obs.message.clone()),
        };
        if let Err(e) = inner.store.set_component_status(id, &obs.component, status).await {
            warn!(deployment_id = %id, component = %obs.component, error = %e, "component status write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_domain::{
        AppDeployment, ComponentSpec, DeploymentPhase, DeploymentProfile, DeploymentProfileType,
        Digest, HelmComponent, TargetState,
    };
    use outpost_runtime::{Monitor, RuntimeError, WorkloadHealth, WorkloadStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Monitor double returning a configurable component state.
    struct ScriptedMonitor {
        polls: AtomicUsize,
        state: Mutex<ComponentState>,
    }

    #[async_trait]
    impl Monitor for ScriptedMonitor {
        fn profile(&self) -> DeploymentProfileType {
            DeploymentProfileType::HelmV3
        }

        async fn status(
            &self,
            deployment: &AppDeployment,
        ) -> Result<Vec<WorkloadStatus>, RuntimeError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let state = *self.state.lock().unwrap();
            Ok(deployment
                .profile
                .components
                .iter()
                .map(|c| WorkloadStatus {
                    component: c.name().to_string(),
                    workload_id: format!("{}-{}", c.name(), deployment.deployment_id.short()),
                    state,
                    health: WorkloadHealth::Unknown,
                    message: "scripted".into(),
                    timestamp: chrono::Utc::now(),
                })
                .collect())
        }
    }

    struct NopDeployer;

    #[async_trait]
    impl outpost_runtime::Deployer for NopDeployer {
        fn profile(&self) -> DeploymentProfileType {
            DeploymentProfileType::HelmV3
        }

        async fn deploy(
            &self,
            _cancel: &CancellationToken,
            _deployment: &AppDeployment,
        ) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn update(
            &self,
            _cancel: &CancellationToken,
            _deployment: &AppDeployment,
        ) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove(
            &self,
            _cancel: &CancellationToken,
            _deployment: &AppDeployment,
        ) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn helm_deployment(id: DeploymentId) -> AppDeployment {
        AppDeployment {
            deployment_id: id,
            name: "web-stack".into(),
            state: TargetState::Running,
            profile: DeploymentProfile {
                profile_type: DeploymentProfileType::HelmV3,
                components: vec![ComponentSpec::Helm(HelmComponent {
                    name: "web".into(),
                    repository: "oci://reg/web".into(),
                    revision: None,
                    wait: None,
                })],
            },
            parameters: Default::default(),
        }
    }

    #[tokio::test]
    async fn observations_flow_into_component_status_and_phase() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.json"));

        let monitor = Arc::new(ScriptedMonitor {
            polls: AtomicUsize::new(0),
            state: Mutex::new(ComponentState::Installed),
        });
        let mut registry = RuntimeRegistry::new();
        registry.register(DeploymentProfileType::HelmV3, Arc::new(NopDeployer), monitor.clone());

        let watcher = Watcher::new(
            Arc::clone(&store),
            Arc::new(registry),
            Duration::from_millis(50),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        store.subscribe(Arc::new(watcher.clone()));

        let id = DeploymentId::new(Uuid::new_v4());
        store
            .upsert_desired_state(id, helm_deployment(id), Digest::sha256(b"v1"))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = store.get(id).await.unwrap();
            if record.phase == DeploymentPhase::Running {
                assert_eq!(
                    record.component_status.get("web").map(|s| s.state),
                    Some(ComponentState::Installed)
                );
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "phase never became RUNNING");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // deletion stops the poll task
        store.remove(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let polls_after_stop = monitor.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(monitor.polls.load(Ordering::SeqCst), polls_after_stop);
    }

    #[tokio::test]
    async fn failed_observation_fails_the_deployment_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.json"));

        let monitor = Arc::new(ScriptedMonitor {
            polls: AtomicUsize::new(0),
            state: Mutex::new(ComponentState::Failed),
        });
        let mut registry = RuntimeRegistry::new();
        registry.register(DeploymentProfileType::HelmV3, Arc::new(NopDeployer), monitor);

        let watcher = Watcher::new(
            Arc::clone(&store),
            Arc::new(registry),
            Duration::from_millis(50),
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        let id = DeploymentId::new(Uuid::new_v4());
        store
            .upsert_desired_state(id, helm_deployment(id), Digest::sha256(b"v1"))
            .await
            .unwrap();
        watcher.watch(id);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = store.get(id).await.unwrap();
            if record.phase == DeploymentPhase::Failed {
                assert!(record.message.contains("web"));
                assert_eq!(
                    record.component_status.get("web").and_then(|s| s.error.as_deref()),
                    Some("scripted")
                );
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "phase never became FAILED");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
