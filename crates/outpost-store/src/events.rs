use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use outpost_domain::{DeploymentId, DeploymentRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An event published by the [`Store`](crate::Store) on every state-changing
/// operation. Carries an immutable snapshot of the record as of the write.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    DesiredStateSet { record: DeploymentRecord },
    CurrentStateSet { record: DeploymentRecord },
    PhaseChanged { record: DeploymentRecord },
    RecordDeleted { deployment_id: DeploymentId },
}

impl StoreEvent {
    pub fn deployment_id(&self) -> DeploymentId {
        match self {
            StoreEvent::DesiredStateSet { record }
            | StoreEvent::CurrentStateSet { record }
            | StoreEvent::PhaseChanged { record } => record.deployment_id,
            StoreEvent::RecordDeleted { deployment_id } => *deployment_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::DesiredStateSet { .. } => "DESIRED_STATE_SET",
            StoreEvent::CurrentStateSet { .. } => "CURRENT_STATE_SET",
            StoreEvent::PhaseChanged { .. } => "PHASE_CHANGED",
            StoreEvent::RecordDeleted { .. } => "RECORD_DELETED",
        }
    }
}

/// A store subscriber. Handlers run on the subscriber's own dispatch task,
/// never on the mutator's; mutating store calls from a handler are therefore
/// safe and cannot deadlock.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn on_event(
        &self,
        event: &StoreEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct SubscriberHandle {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// Registry of subscribers, each with its own unbounded queue and dispatch
/// task. A failing or slow subscriber never blocks the mutator or its peers,
/// and per-subscriber delivery order equals emission order.
#[derive(Default)]
pub(crate) struct SubscriberSet {
    inner: Mutex<HashMap<String, SubscriberHandle>>,
}

impl SubscriberSet {
    pub(crate) fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let id = subscriber.id().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreEvent>();
        let task_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = subscriber.on_event(&event).await {
                    warn!(
                        subscriber = %task_id,
                        event = event.kind(),
                        error = %e,
                        "subscriber handler failed; event dropped for this subscriber"
                    );
                }
            }
            debug!(subscriber = %task_id, "subscriber dispatch task exited");
        });

        // Replacing an existing id drops the old sender; its task drains
        // queued events and exits.
        self.inner
            .lock()
            .expect("subscriber registry poisoned")
            .insert(id, SubscriberHandle { tx });
    }

    pub(crate) fn unsubscribe(&self, id: &str) {
        self.inner
            .lock()
            .expect("subscriber registry poisoned")
            .remove(id);
    }

    pub(crate) fn publish(&self, event: &StoreEvent) {
        let guard = self.inner.lock().expect("subscriber registry poisoned");
        for (id, handle) in guard.iter() {
            if handle.tx.send(event.clone()).is_err() {
                warn!(subscriber = %id, "subscriber queue closed; event not delivered");
            }
        }
    }
}
