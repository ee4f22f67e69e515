use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use outpost_config::{AgentConfig, RuntimeEntry};
use outpost_domain::{DeploymentProfileType, DeviceIdentity};
use outpost_runtime::{ComposeRuntime, ComposeRuntimeConfig, HelmRuntime, RuntimeRegistry};
use outpost_store::Store;
use outpost_wfm::{ClientCredentialsTokenProvider, WfmClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capabilities;
use crate::error::AgentError;
use crate::onboarding;
use crate::reconciler::Reconciler;
use crate::reporter::StatusReporter;
use crate::sync::SyncLoop;
use crate::watcher::Watcher;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Start every component in dependency order and run until the root token is
/// cancelled. The store loads before anything else; nothing starts until
/// onboarding has returned; in-flight deployments are abandoned on shutdown
/// and re-driven by the sweeper on the next start.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
    std::fs::create_dir_all(&config.data_dir).map_err(|e| AgentError::Io {
        path: config.data_dir.display().to_string(),
        source: e,
    })?;
    // one agent per data directory
    let _lock = acquire_lock(&config)?;

    let store = Store::open(&config.data_dir.join("state.json"));
    let flusher = store.spawn_flusher(shutdown.child_token());

    // Onboarding runs over the config-auth (or unauthenticated) client;
    // everything afterwards prefers the credentials it returned.
    let base_client = build_client(&config, None)?;
    let device_id = onboarding::ensure_onboarded(&store, &base_client, &config, &shutdown).await?;

    let identity = store.get_device_identity().await;
    let client = Arc::new(build_client(&config, identity.as_ref())?);

    capabilities::report_capabilities(&client, &device_id, &config.capabilities).await;

    let registry = Arc::new(build_registry(&config));

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.timeouts.deployer_op,
        shutdown.child_token(),
    );
    let watcher = Watcher::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        WATCH_POLL_INTERVAL,
        config.timeouts.monitor_poll,
        shutdown.child_token(),
    );
    let reporter = StatusReporter::new(
        Arc::clone(&client),
        device_id.clone(),
        config.timeouts.status_report,
        shutdown.child_token(),
    );

    store.subscribe(Arc::new(reconciler.clone()));
    store.subscribe(Arc::new(watcher.clone()));
    store.subscribe(Arc::new(reporter.clone()));

    watcher.resume().await;
    let sweeper = reconciler.spawn_sweeper();
    let retry = reporter.spawn_retry();

    let sync_loop = Arc::new(SyncLoop {
        store: Arc::clone(&store),
        client,
        device_id: device_id.clone(),
        interval: config.state_seeking.interval,
        cycle_timeout: config.timeouts.sync_cycle,
        bundle_deployment_threshold: config.state_seeking.bundle_deployment_threshold,
        bundle_size_cap_bytes: config.state_seeking.bundle_size_cap_bytes,
    });
    let sync_task = sync_loop.spawn(shutdown.child_token());

    info!(device_id = %device_id, "agent started");
    shutdown.cancelled().await;
    info!("shutdown requested; stopping components");

    let join_all = async {
        let _ = tokio::join!(flusher, sweeper, retry, sync_task);
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all).await.is_err() {
        warn!("components did not stop within the shutdown deadline");
    }
    if let Err(e) = store.flush().await {
        warn!(error = %e, "final state flush failed");
    }
    info!("agent stopped");
    Ok(())
}

/// Advisory lock with the agent PID, preventing two agents on one data
/// directory. Opened without truncation so a failed acquisition leaves the
/// running agent's PID intact.
fn acquire_lock(config: &AgentConfig) -> Result<std::fs::File, AgentError> {
    let path = config.data_dir.join("outpostd.lock");
    let io_err = |source| AgentError::Io {
        path: path.display().to_string(),
        source,
    };

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(io_err)?;
    file.try_lock_exclusive().map_err(|_| AgentError::LockHeld {
        path: path.display().to_string(),
    })?;

    let mut file = file;
    file.set_len(0).map_err(io_err)?;
    writeln!(file, "{}", std::process::id()).map_err(io_err)?;
    Ok(file)
}

fn build_client(
    config: &AgentConfig,
    identity: Option<&DeviceIdentity>,
) -> Result<WfmClient, AgentError> {
    let mut client = WfmClient::new(&config.wfm.sbi_url, config.wfm.ca_cert_path.as_deref())?;

    // credentials from onboarding take precedence over static config
    let creds = identity
        .filter(|i| i.auth_enabled)
        .and_then(|i| {
            Some((
                i.oauth_client_id.clone()?,
                i.oauth_client_secret.clone()?,
                i.oauth_token_url.clone()?,
            ))
        })
        .or_else(|| {
            config
                .wfm
                .auth
                .as_ref()
                .map(|a| (a.client_id.clone(), a.client_secret.clone(), a.token_url.clone()))
        });

    if let Some((client_id, client_secret, token_url)) = creds {
        client = client.with_auth(Arc::new(ClientCredentialsTokenProvider::new(
            client_id,
            client_secret,
            token_url,
        )));
    }
    Ok(client)
}

fn build_registry(config: &AgentConfig) -> RuntimeRegistry {
    let mut registry = RuntimeRegistry::new();
    for entry in &config.runtimes {
        match entry {
            RuntimeEntry::Kubernetes(k) => {
                let runtime = Arc::new(HelmRuntime::new(
                    k.kubeconfig_path.clone(),
                    config.timeouts.deployer_op,
                    config.timeouts.monitor_poll,
                ));
                registry.register(DeploymentProfileType::HelmV3, runtime.clone(), runtime);
            }
            RuntimeEntry::Docker(d) => {
                let cert_dir = d
                    .tls
                    .as_ref()
                    .and_then(|t| t.cert_path.parent().map(|p| p.to_path_buf()));
                let runtime = Arc::new(ComposeRuntime::new(ComposeRuntimeConfig {
                    host_url: d.url.clone(),
                    cert_dir,
                    tls_verify: d.tls.is_some() && !d.tls_skip_verification,
                    projects_dir: config.data_dir.join("compose"),
                    op_timeout: config.timeouts.deployer_op,
                    probe_timeout: config.timeouts.monitor_poll,
                }));
                registry.register(DeploymentProfileType::Compose, runtime.clone(), runtime);
            }
        }
    }
    registry
}
