use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use outpost_domain::{
    AppDeployment, DeploymentId, DeploymentPhase, DeploymentRecord, Digest, TargetState,
};
use outpost_runtime::{Deployer, RuntimeError, RuntimeRegistry};
use outpost_store::{Store, StoreEvent, StoreError, Subscriber};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The workload manager: drives each deployment toward its desired state by
/// invoking the profile's deployer.
///
/// Per-id serialization is the central invariant: each deployment id gets at
/// most one worker task, fed by a capacity-1 kick channel, so at most one
/// deploy/update/remove runs per id at any moment while distinct ids proceed
/// in parallel. A periodic sweeper re-enqueues anything still divergent,
/// guarding against missed events.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    registry: Arc<RuntimeRegistry>,
    op_timeout: Duration,
    cancel: CancellationToken,
    workers: Mutex<HashMap<DeploymentId, mpsc::Sender<()>>>,
    /// Desired digests whose reconcile failed fatally; skipped until the
    /// desired state changes.
    parked: Mutex<HashMap<DeploymentId, Digest>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<RuntimeRegistry>,
        op_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                op_timeout,
                cancel,
                workers: Mutex::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue a reconcile for `id`. Kicks while a task is already queued
    /// coalesce; a finished worker is respawned transparently.
    pub fn kick(&self, id: DeploymentId) {
        let mut workers = self.inner.workers.lock().expect("worker map poisoned");
        if let Some(tx) = workers.get(&id) {
            match tx.try_send(()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(())) => return, // already queued
                Err(mpsc::error::TrySendError::Closed(())) => {
                    workers.remove(&id);
                }
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());
        workers.insert(id, tx);
        tokio::spawn(run_worker(Arc::clone(&self.inner), id, rx));
    }

    /// Periodic sweep: re-enqueue every divergent record (covers missed
    /// events and work abandoned by a previous process), prune dead workers,
    /// and surface the store health signal.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.inner.cancel.cancelled() => {
                        debug!("reconcile sweeper stopped");
                        return;
                    }
                }

                for record in this.inner.store.list().await {
                    if record.needs_reconciliation() {
                        this.kick(record.deployment_id);
                    }
                }
                this.inner
                    .workers
                    .lock()
                    .expect("worker map poisoned")
                    .retain(|_, tx| !tx.is_closed());

                if !this.inner.store.healthy() {
                    warn!("state persistence is failing; recent changes are not durable yet");
                }
            }
        })
    }
}

#[async_trait]
impl Subscriber for Reconciler {
    fn id(&self) -> &str {
        "reconciler"
    }

    async fn on_event(
        &self,
        event: &StoreEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match event {
            StoreEvent::RecordDeleted { deployment_id } => {
                // dropping the sender lets the worker drain and exit
                self.inner
                    .workers
                    .lock()
                    .expect("worker map poisoned")
                    .remove(deployment_id);
                self.inner
                    .parked
                    .lock()
                    .expect("parked map poisoned")
                    .remove(deployment_id);
            }
            event => {
                let id = event.deployment_id();
                if self.inner.store.needs_reconciliation(id).await {
                    self.kick(id);
                }
            }
        }
        Ok(())
    }
}

async fn run_worker(inner: Arc<Inner>, id: DeploymentId, mut rx: mpsc::Receiver<()>) {
    debug!(deployment_id = %id, "reconcile worker started");
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(()) => {
                    if let Err(e) = inner.reconcile_one(id).await {
                        warn!(deployment_id = %id, error = %e, "reconcile store write failed");
                    }
                }
                None => break,
            },
            _ = inner.cancel.cancelled() => break,
        }
    }
    debug!(deployment_id = %id, "reconcile worker exited");
}

impl Inner {
    async fn reconcile_one(&self, id: DeploymentId) -> Result<(), StoreError> {
        let Some(record) = self.store.get(id).await else {
            return Ok(());
        };
        if !record.needs_reconciliation() {
            return Ok(());
        }
        let Some(desired) = record.desired_state.clone() else {
            return Ok(());
        };

        {
            let parked = self.parked.lock().expect("parked map poisoned");
            if parked.get(&id).is_some() && parked.get(&id) == record.digest.as_ref() {
                debug!(deployment_id = %id, "fatal failure parked; waiting for a new desired state");
                return Ok(());
            }
        }

        let deployer = match self.registry.deployer_for(desired.profile.profile_type) {
            Ok(d) => d,
            Err(e) => {
                self.record_failure(id, &record, &e.to_string(), e.is_fatal()).await?;
                return Ok(());
            }
        };

        match desired.state {
            TargetState::Removing => self.remove_deployment(id, &record, &desired, deployer).await,
            TargetState::Running => self.apply_deployment(id, &record, &desired, deployer).await,
        }
    }

    async fn apply_deployment(
        &self,
        id: DeploymentId,
        record: &DeploymentRecord,
        desired: &AppDeployment,
        deployer: Arc<dyn Deployer>,
    ) -> Result<(), StoreError> {
        let installing = record.current_state.is_none();
        let verb = if installing { "installing" } else { "updating" };
        self.store.set_phase(id, DeploymentPhase::Deploying, verb).await?;
        info!(
            deployment_id = %id,
            profile = %desired.profile.profile_type,
            verb,
            "driving deployment toward desired state"
        );

        let op = async {
            if installing {
                deployer.deploy(&self.cancel, desired).await
            } else {
                deployer.update(&self.cancel, desired).await
            }
        };
        let outcome = match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout {
                context: format!("deployer {}", verb),
                seconds: self.op_timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(()) => {
                self.parked.lock().expect("parked map poisoned").remove(&id);
                self.store.set_current_state(id, desired.clone()).await?;
                self.store
                    .set_phase(id, DeploymentPhase::Running, "deployment applied")
                    .await?;
            }
            Err(RuntimeError::Cancelled) => {
                // shutdown: abandoned in place, re-driven on next start
                debug!(deployment_id = %id, "deployer cancelled mid-flight");
            }
            Err(e) => {
                self.record_failure(id, record, &e.to_string(), e.is_fatal()).await?;
            }
        }
        Ok(())
    }

    async fn remove_deployment(
        &self,
        id: DeploymentId,
        record: &DeploymentRecord,
        desired: &AppDeployment,
        deployer: Arc<dyn Deployer>,
    ) -> Result<(), StoreError> {
        self.store
            .set_phase(id, DeploymentPhase::Removing, "removing deployment")
            .await?;
        info!(deployment_id = %id, "removing deployment");

        // release/project names come from the spec that was actually applied
        let target = record.current_state.as_ref().unwrap_or(desired);
        let outcome = match tokio::time::timeout(self.op_timeout, deployer.remove(&self.cancel, target)).await
        {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout {
                context: "deployer remove".into(),
                seconds: self.op_timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(()) => {
                self.store
                    .set_phase(id, DeploymentPhase::Removed, "deployment removed")
                    .await?;
                self.store.remove(id).await?;
            }
            Err(RuntimeError::Cancelled) => {
                debug!(deployment_id = %id, "removal cancelled mid-flight");
            }
            Err(e) => {
                self.record_failure(id, record, &format!("removal failed: {}", e), e.is_fatal())
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: DeploymentId,
        record: &DeploymentRecord,
        message: &str,
        fatal: bool,
    ) -> Result<(), StoreError> {
        if fatal {
            if let Some(digest) = &record.digest {
                self.parked
                    .lock()
                    .expect("parked map poisoned")
                    .insert(id, digest.clone());
            }
        }
        self.store.set_phase(id, DeploymentPhase::Failed, message).await
    }
}
