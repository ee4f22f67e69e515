//! End-to-end agent scenarios: sync loop, reconciler, watcher and status
//! reporter wired against a mock fleet manager and a stub runtime.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use outpost_agent::reconciler::Reconciler;
use outpost_agent::reporter::StatusReporter;
use outpost_agent::sync::SyncLoop;
use outpost_agent::watcher::Watcher;
use outpost_domain::{
    AppDeployment, ComponentState, DeploymentId, DeploymentPhase, DeploymentProfileType,
    DeploymentRecord, Digest, ManifestMetadata,
};
use outpost_runtime::{
    Deployer, Monitor, RuntimeError, RuntimeRegistry, WorkloadHealth, WorkloadStatus,
};
use outpost_store::Store;
use outpost_wfm::WfmClient;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEVICE: &str = "dev-A";

fn deployment_yaml(id: &str, name: &str) -> String {
    format!(
        r#"apiVersion: apps.outpost.dev/v1alpha1
kind: AppDeployment
metadata:
  id: {id}
  name: {name}
spec:
  deploymentProfile:
    type: helm.v3
    components:
      - name: {name}
        properties:
          repository: oci://reg/{name}
          revision: 1.0.0
  parameters:
    port: "8080"
"#
    )
}

fn manifest_body(version: u64, entries: &[(&str, &Digest)]) -> serde_json::Value {
    serde_json::json!({
        "manifestVersion": version,
        "deployments": entries
            .iter()
            .map(|(id, digest)| serde_json::json!({
                "deploymentId": id,
                "digest": digest.as_str(),
                "url": format!("https://fm.example/d/{id}"),
            }))
            .collect::<Vec<_>>(),
    })
}

/// Stub runtime shared by deployer and monitor roles: remembers which
/// deployments are "up" so the monitor can report them installed.
struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    up: Mutex<HashSet<DeploymentId>>,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            up: Mutex::new(HashSet::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for FakeRuntime {
    fn profile(&self) -> DeploymentProfileType {
        DeploymentProfileType::HelmV3
    }

    async fn deploy(
        &self,
        _cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        self.up.lock().unwrap().insert(deployment.deployment_id);
        self.calls.lock().unwrap().push(format!("deploy {}", deployment.name));
        Ok(())
    }

    async fn update(
        &self,
        _cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        self.up.lock().unwrap().insert(deployment.deployment_id);
        self.calls.lock().unwrap().push(format!("update {}", deployment.name));
        Ok(())
    }

    async fn remove(
        &self,
        _cancel: &CancellationToken,
        deployment: &AppDeployment,
    ) -> Result<(), RuntimeError> {
        self.up.lock().unwrap().remove(&deployment.deployment_id);
        self.calls.lock().unwrap().push(format!("remove {}", deployment.name));
        Ok(())
    }
}

#[async_trait]
impl Monitor for FakeRuntime {
    fn profile(&self) -> DeploymentProfileType {
        DeploymentProfileType::HelmV3
    }

    async fn status(
        &self,
        deployment: &AppDeployment,
    ) -> Result<Vec<WorkloadStatus>, RuntimeError> {
        let installed = self.up.lock().unwrap().contains(&deployment.deployment_id);
        Ok(deployment
            .profile
            .components
            .iter()
            .map(|c| WorkloadStatus {
                component: c.name().to_string(),
                workload_id: format!("{}-{}", c.name(), deployment.deployment_id.short()),
                state: if installed {
                    ComponentState::Installed
                } else {
                    ComponentState::Installing
                },
                health: if installed {
                    WorkloadHealth::Healthy
                } else {
                    WorkloadHealth::Unknown
                },
                message: String::new(),
                timestamp: chrono::Utc::now(),
            })
            .collect())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    sync: Arc<SyncLoop>,
    runtime: Arc<FakeRuntime>,
}

async fn harness(server: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("state.json"));

    let runtime = FakeRuntime::new();
    let mut registry = RuntimeRegistry::new();
    registry.register(DeploymentProfileType::HelmV3, runtime.clone(), runtime.clone());
    let registry = Arc::new(registry);

    let cancel = CancellationToken::new();
    let client = Arc::new(WfmClient::new(server.uri(), None).unwrap());

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Duration::from_secs(5),
        cancel.child_token(),
    );
    let watcher = Watcher::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Duration::from_millis(50),
        Duration::from_secs(1),
        cancel.child_token(),
    );
    let reporter = StatusReporter::new(
        Arc::clone(&client),
        DEVICE.into(),
        Duration::from_secs(2),
        cancel.child_token(),
    );

    store.subscribe(Arc::new(reconciler.clone()));
    store.subscribe(Arc::new(watcher.clone()));
    store.subscribe(Arc::new(reporter.clone()));

    let sync = Arc::new(SyncLoop {
        store: Arc::clone(&store),
        client,
        device_id: DEVICE.into(),
        interval: Duration::from_secs(3600), // cycles run manually in tests
        cycle_timeout: Duration::from_secs(10),
        bundle_deployment_threshold: 2,
        bundle_size_cap_bytes: 50 * 1024 * 1024,
    });

    Harness { _dir: dir, store, sync, runtime }
}

async fn wait_record<F>(store: &Store, id: DeploymentId, what: &str, pred: F)
where
    F: Fn(&Option<DeploymentRecord>) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = store.get(id).await;
        if pred(&record) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} (record: {:?})",
            what,
            record
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn mount_status_ok(server: &MockServer) -> impl std::future::Future<Output = ()> + '_ {
    Mock::given(method("POST"))
        .and(path_regex(r"^/device/dev-A/deployment/[0-9a-f-]+/status$"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
}

// S1: cold start to a running Helm deployment, with status reported.
#[tokio::test]
async fn cold_start_reaches_running_and_reports() {
    let server = MockServer::start().await;
    let id_str = "11111111-1111-1111-1111-111111111111";
    let yaml = deployment_yaml(id_str, "web");
    let digest = Digest::sha256(yaml.as_bytes());

    Mock::given(method("POST"))
        .and(path("/state"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(manifest_body(1, &[(id_str, &digest)])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/device/dev-A/deployment/{}", id_str)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(yaml.clone().into_bytes()))
        .mount(&server)
        .await;
    // at least one RUNNING status must be posted
    Mock::given(method("POST"))
        .and(path(format!("/device/dev-A/deployment/{}/status", id_str)))
        .and(body_partial_json(serde_json::json!({"state": "RUNNING"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1..)
        .mount(&server)
        .await;
    mount_status_ok(&server).await;

    let h = harness(&server).await;
    h.sync.run_cycle().await.unwrap();

    let id = DeploymentId::parse(id_str).unwrap();
    wait_record(&h.store, id, "phase RUNNING", |r| {
        r.as_ref().map(|r| r.phase) == Some(DeploymentPhase::Running)
    })
    .await;

    let record = h.store.get(id).await.unwrap();
    assert!(record.current_state.is_some());
    assert_eq!(record.digest, Some(digest));
    assert_eq!(h.runtime.calls(), vec!["deploy web"]);

    // watcher confirms via component status
    wait_record(&h.store, id, "component INSTALLED", |r| {
        r.as_ref()
            .map(|r| {
                r.component_status.get("web").map(|s| s.state) == Some(ComponentState::Installed)
            })
            .unwrap_or(false)
    })
    .await;

    let meta = h.store.get_manifest_metadata().await;
    assert_eq!(meta.last_synced_manifest_version, 1);
    assert_eq!(meta.last_synced_etag.as_deref(), Some("\"v1\""));
}

// S2: a lower manifest version is a rollback attack: no store mutation.
#[tokio::test]
async fn manifest_version_rollback_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/state"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v4\"")
                .set_body_json(manifest_body(4, &[])),
        )
        .mount(&server)
        .await;

    let h = harness(&server).await;
    h.store
        .upsert_manifest_metadata(ManifestMetadata {
            last_synced_manifest_version: 5,
            last_synced_etag: Some("\"v5\"".into()),
            last_synced_bundle_digest: None,
        })
        .await;

    let err = h.sync.run_cycle().await.unwrap_err();
    assert!(err.to_string().contains("rollback"), "{}", err);

    let meta = h.store.get_manifest_metadata().await;
    assert_eq!(meta.last_synced_manifest_version, 5);
    assert_eq!(meta.last_synced_etag.as_deref(), Some("\"v5\""));
    assert!(h.store.list().await.is_empty());
    assert!(h.runtime.calls().is_empty());
}

// S3: bundle extraction with one digest mismatch among three deployments.
#[tokio::test]
async fn bundle_extraction_rejects_mismatched_digests_only() {
    let server = MockServer::start().await;
    let ids = [
        "11111111-1111-1111-1111-111111111111",
        "22222222-2222-2222-2222-222222222222",
        "33333333-3333-3333-3333-333333333333",
    ];
    let yamls: Vec<String> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| deployment_yaml(id, &format!("app{}", i)))
        .collect();

    // build the tar.gz bundle
    let bundle_bytes = {
        let enc = GzEncoder::new(Vec::new(), Compression::fast());
        let mut tar = tar::Builder::new(enc);
        for (id, yaml) in ids.iter().zip(&yamls) {
            let mut header = tar::Header::new_gnu();
            header.set_size(yaml.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, format!("{}.yaml", id), yaml.as_bytes())
                .unwrap();
        }
        tar.into_inner().unwrap().finish().unwrap()
    };
    let bundle_digest = Digest::sha256(&bundle_bytes);

    let good0 = Digest::sha256(yamls[0].as_bytes());
    let good1 = Digest::sha256(yamls[1].as_bytes());
    let tampered = Digest::sha256(b"tampered content"); // will not match yamls[2]

    let mut manifest = manifest_body(
        1,
        &[(ids[0], &good0), (ids[1], &good1), (ids[2], &tampered)],
    );
    manifest["bundle"] = serde_json::json!({
        "digest": bundle_digest.as_str(),
        "sizeBytes": 10 * 1024 * 1024,
    });

    Mock::given(method("POST"))
        .and(path("/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/device/dev-A/bundle/{}", bundle_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bundle_bytes))
        .expect(1) // the bundle is downloaded exactly once
        .mount(&server)
        .await;
    mount_status_ok(&server).await;

    let h = harness(&server).await;
    h.sync.run_cycle().await.unwrap();

    for id_str in &ids[..2] {
        let id = DeploymentId::parse(id_str).unwrap();
        wait_record(&h.store, id, "phase RUNNING", |r| {
            r.as_ref().map(|r| r.phase) == Some(DeploymentPhase::Running)
        })
        .await;
    }

    let bad = DeploymentId::parse(ids[2]).unwrap();
    let record = h.store.get(bad).await.unwrap();
    assert_eq!(record.phase, DeploymentPhase::Failed);
    assert!(record.message.contains("digest"), "{}", record.message);
    assert!(record.desired_state.is_none());
}

// S4: a deployment dropped from the manifest is removed end to end.
#[tokio::test]
async fn dropped_deployment_is_uninstalled_and_deleted() {
    let server = MockServer::start().await;
    let id_str = "22222222-2222-2222-2222-222222222222";
    let yaml = deployment_yaml(id_str, "api");
    let digest = Digest::sha256(yaml.as_bytes());
    let id = DeploymentId::parse(id_str).unwrap();

    let v1 = Mock::given(method("POST"))
        .and(path("/state"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(manifest_body(1, &[(id_str, &digest)])),
        )
        .mount_as_scoped(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/device/dev-A/deployment/{}", id_str)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(yaml.clone().into_bytes()))
        .mount(&server)
        .await;
    // the terminal REMOVED status must reach the fleet manager
    Mock::given(method("POST"))
        .and(path(format!("/device/dev-A/deployment/{}/status", id_str)))
        .and(body_partial_json(serde_json::json!({"state": "REMOVED"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1..)
        .mount(&server)
        .await;
    mount_status_ok(&server).await;

    let h = harness(&server).await;
    h.sync.run_cycle().await.unwrap();
    wait_record(&h.store, id, "phase RUNNING", |r| {
        r.as_ref().map(|r| r.phase) == Some(DeploymentPhase::Running)
    })
    .await;

    // second sync: the manifest no longer lists the deployment
    drop(v1);
    Mock::given(method("POST"))
        .and(path("/state"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v2\"")
                .set_body_json(manifest_body(2, &[])),
        )
        .mount(&server)
        .await;

    h.sync.run_cycle().await.unwrap();
    wait_record(&h.store, id, "record deletion", |r| r.is_none()).await;
    assert_eq!(h.runtime.calls(), vec!["deploy api", "remove api"]);
}

// S5: an identical manifest resend produces no desired-state events and no
// runtime calls.
#[tokio::test]
async fn identical_manifest_resend_is_idempotent() {
    let server = MockServer::start().await;
    let id_str = "11111111-1111-1111-1111-111111111111";
    let yaml = deployment_yaml(id_str, "web");
    let digest = Digest::sha256(yaml.as_bytes());
    let id = DeploymentId::parse(id_str).unwrap();

    Mock::given(method("POST"))
        .and(path("/state"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(manifest_body(1, &[(id_str, &digest)])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/device/dev-A/deployment/{}", id_str)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(yaml.clone().into_bytes()))
        .mount(&server)
        .await;
    mount_status_ok(&server).await;

    let h = harness(&server).await;
    h.sync.run_cycle().await.unwrap();
    wait_record(&h.store, id, "phase RUNNING", |r| {
        r.as_ref().map(|r| r.phase) == Some(DeploymentPhase::Running)
    })
    .await;
    let calls_after_first = h.runtime.calls().len();

    // same version, same digests: nothing changes
    h.sync.run_cycle().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let record = h.store.get(id).await.unwrap();
    assert_eq!(record.phase, DeploymentPhase::Running);
    assert_eq!(h.runtime.calls().len(), calls_after_first);
    assert_eq!(h.store.get_manifest_metadata().await.last_synced_manifest_version, 1);
}
