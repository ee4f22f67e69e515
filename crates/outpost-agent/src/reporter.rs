use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use outpost_domain::DeploymentId;
use outpost_store::{StoreEvent, Subscriber};
use outpost_wfm::{DeploymentStatus, WfmClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Ships observed state to the fleet manager with at-least-once delivery:
/// a failed send parks the status and a retry timer re-sends it. Newer
/// statuses for the same id replace parked ones (latest wins per id).
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<WfmClient>,
    device_id: String,
    report_timeout: Duration,
    cancel: CancellationToken,
    pending: Mutex<HashMap<DeploymentId, DeploymentStatus>>,
}

impl StatusReporter {
    pub fn new(
        client: Arc<WfmClient>,
        device_id: String,
        report_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                device_id,
                report_timeout,
                cancel,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn send(&self, status: DeploymentStatus) {
        let id = status.deployment_id;
        let result = tokio::time::timeout(
            self.inner.report_timeout,
            self.inner.client.post_status(&self.inner.device_id, &status),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(deployment_id = %id, state = %status.state, "deployment status reported");
                // a stale parked status must not overwrite this one later
                self.inner.pending.lock().expect("pending map poisoned").remove(&id);
            }
            Ok(Err(e)) => {
                warn!(deployment_id = %id, error = %e, "status report failed; parked for retry");
                self.inner.pending.lock().expect("pending map poisoned").insert(id, status);
            }
            Err(_) => {
                warn!(deployment_id = %id, "status report timed out; parked for retry");
                self.inner.pending.lock().expect("pending map poisoned").insert(id, status);
            }
        }
    }

    /// Retry timer for parked statuses.
    pub fn spawn_retry(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.inner.cancel.cancelled() => {
                        debug!("status retry timer stopped");
                        return;
                    }
                }

                let parked: Vec<DeploymentStatus> = {
                    let mut pending =
                        this.inner.pending.lock().expect("pending map poisoned");
                    pending.drain().map(|(_, status)| status).collect()
                };
                for status in parked {
                    this.send(status).await;
                }
            }
        })
    }

    /// Visible for tests: count of statuses awaiting retry.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending map poisoned").len()
    }
}

#[async_trait]
impl Subscriber for StatusReporter {
    fn id(&self) -> &str {
        "status-reporter"
    }

    async fn on_event(
        &self,
        event: &StoreEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let record = match event {
            StoreEvent::PhaseChanged { record } | StoreEvent::DesiredStateSet { record } => record,
            _ => return Ok(()),
        };
        // the record snapshot travels with the event, so the terminal REMOVED
        // status can still be reported after the record is deleted
        self.send(DeploymentStatus::from_record(record)).await;
        Ok(())
    }
}
