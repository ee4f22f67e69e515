use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use outpost_domain::{AppState, DeploymentId, Digest};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::auth::TokenProvider;
use crate::error::WfmError;
use crate::types::{
    DeploymentStatus, OnboardingRequest, OnboardingResponse, SyncOutcome,
    UnsignedAppStateManifest,
};

/// Default deadline for control-plane calls (onboarding, capabilities,
/// status). Retrieval calls get a longer one.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the fleet manager's southbound interface.
///
/// Auth is an outgoing-request decorator: when a [`TokenProvider`] is
/// attached every call carries a bearer token, otherwise none does. No other
/// component knows whether auth is enabled.
pub struct WfmClient {
    base_url: String,
    http: reqwest::Client,
    auth: Option<Arc<dyn TokenProvider>>,
}

impl WfmClient {
    /// Build the client. `ca_cert_path` pins the fleet manager's CA: when
    /// set, only that certificate is trusted.
    pub fn new(base_url: impl Into<String>, ca_cert_path: Option<&Path>) -> Result<Self, WfmError> {
        let mut builder = reqwest::Client::builder().timeout(FETCH_TIMEOUT);
        if let Some(path) = ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                WfmError::Transport(format!("read CA cert {}: {}", path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| WfmError::Transport(format!("parse CA cert: {}", e)))?;
            builder = builder
                .add_root_certificate(cert)
                .tls_built_in_root_certs(false);
        }
        let http = builder
            .build()
            .map_err(|e| WfmError::Transport(format!("build http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            auth: None,
        })
    }

    pub fn with_auth(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth.is_some()
    }

    async fn bearer(&self) -> Result<Option<String>, WfmError> {
        match &self.auth {
            Some(provider) => Ok(Some(provider.token().await?)),
            None => Ok(None),
        }
    }

    fn decorate(
        &self,
        req: reqwest::RequestBuilder,
        bearer: &Option<String>,
    ) -> reqwest::RequestBuilder {
        match bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    // ── Onboarding ────────────────────────────────────────────────────────────

    /// `POST /onboarding/device` carrying the device signature.
    pub async fn onboard_device(
        &self,
        device_id: &str,
        device_signature: &str,
    ) -> Result<OnboardingResponse, WfmError> {
        let url = format!("{}/onboarding/device", self.base_url);
        let body = OnboardingRequest {
            device_id: device_id.to_string(),
            device_signature: device_signature.to_string(),
        };
        let bearer = self.bearer().await?;
        let resp = self
            .decorate(self.http.post(&url), &bearer)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<OnboardingResponse>()
                .await
                .map_err(|e| WfmError::Protocol(format!("onboarding response decode: {}", e))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WfmError::Auth(format!(
                "onboarding refused with HTTP {}",
                resp.status()
            ))),
            s => Err(WfmError::Status {
                context: "onboarding".into(),
                status: s.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    // ── Capabilities ──────────────────────────────────────────────────────────

    /// `POST /device/{id}/capabilities`. 2xx is success; anything else is an
    /// error the caller treats as non-fatal.
    pub async fn post_capabilities(
        &self,
        device_id: &str,
        capabilities: &serde_json::Value,
    ) -> Result<(), WfmError> {
        let url = format!("{}/device/{}/capabilities", self.base_url, device_id);
        let bearer = self.bearer().await?;
        let resp = self
            .decorate(self.http.post(&url), &bearer)
            .timeout(REQUEST_TIMEOUT)
            .json(capabilities)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WfmError::Status {
                context: "capabilities".into(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    // ── Sync ──────────────────────────────────────────────────────────────────

    /// `POST /state` with the flattened current app states and the stored
    /// ETag as `If-None-Match`. Returns the manifest or NotModified.
    pub async fn sync_state(
        &self,
        device_id: &str,
        etag: Option<&str>,
        states: &[AppState],
    ) -> Result<SyncOutcome, WfmError> {
        let url = format!("{}/state", self.base_url);
        let bearer = self.bearer().await?;
        let mut req = self
            .decorate(self.http.post(&url), &bearer)
            .timeout(REQUEST_TIMEOUT)
            .query(&[("deviceId", device_id)])
            .json(states);
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        let resp = req.send().await?;

        match resp.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("manifest not modified");
                Ok(SyncOutcome::NotModified)
            }
            s if s.is_success() => {
                let etag = resp
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let manifest = resp
                    .json::<UnsignedAppStateManifest>()
                    .await
                    .map_err(|e| WfmError::Protocol(format!("manifest decode: {}", e)))?;
                info!(
                    version = ?manifest.manifest_version,
                    deployments = manifest.deployments.len(),
                    "manifest received"
                );
                Ok(SyncOutcome::Manifest { manifest, etag })
            }
            s => Err(WfmError::Status {
                context: "state sync".into(),
                status: s.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    // ── Retrieval ─────────────────────────────────────────────────────────────

    /// `GET /device/{id}/deployment/{depId}?digest=...`: one deployment YAML.
    pub async fn fetch_deployment(
        &self,
        device_id: &str,
        deployment_id: DeploymentId,
        digest: &Digest,
    ) -> Result<Vec<u8>, WfmError> {
        let url = format!(
            "{}/device/{}/deployment/{}",
            self.base_url, device_id, deployment_id
        );
        let bearer = self.bearer().await?;
        let resp = self
            .decorate(self.http.get(&url), &bearer)
            .query(&[("digest", digest.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WfmError::Status {
                context: format!("fetch deployment {}", deployment_id),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// `GET /device/{id}/bundle/{digest}`: the tar.gz bundle.
    pub async fn fetch_bundle(&self, device_id: &str, digest: &Digest) -> Result<Vec<u8>, WfmError> {
        let url = format!("{}/device/{}/bundle/{}", self.base_url, device_id, digest);
        let bearer = self.bearer().await?;
        let resp = self.decorate(self.http.get(&url), &bearer).send().await?;
        if !resp.status().is_success() {
            return Err(WfmError::Status {
                context: "fetch bundle".into(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    // ── Status ────────────────────────────────────────────────────────────────

    /// `POST /device/{id}/deployment/{depId}/status`.
    pub async fn post_status(
        &self,
        device_id: &str,
        status: &DeploymentStatus,
    ) -> Result<(), WfmError> {
        let url = format!(
            "{}/device/{}/deployment/{}/status",
            self.base_url, device_id, status.deployment_id
        );
        let bearer = self.bearer().await?;
        let resp = self
            .decorate(self.http.post(&url), &bearer)
            .timeout(REQUEST_TIMEOUT)
            .json(status)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WfmError::Status {
                context: "status report".into(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use outpost_domain::DeploymentPhase;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> WfmClient {
        WfmClient::new(server.uri(), None).unwrap()
    }

    #[tokio::test]
    async fn onboarding_returns_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/onboarding/device"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "clientId": "client-A",
                "clientSecret": "secret-A",
                "tokenEndpointUrl": "https://idp.example/token",
            })))
            .mount(&server)
            .await;

        let resp = client(&server).onboard_device("dev-A", "sig-bytes").await.unwrap();
        assert_eq!(resp.client_id, "client-A");
        assert_eq!(resp.client_secret.as_deref(), Some("secret-A"));
    }

    #[tokio::test]
    async fn onboarding_401_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/onboarding/device"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server).onboard_device("dev-A", "sig").await.unwrap_err();
        assert!(matches!(err, WfmError::Auth(_)));
    }

    #[tokio::test]
    async fn sync_304_yields_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state"))
            .and(header("if-none-match", "\"etag-1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .sync_state("dev-A", Some("\"etag-1\""), &[])
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::NotModified));
    }

    #[tokio::test]
    async fn sync_200_yields_manifest_and_etag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state"))
            .and(query_param("deviceId", "dev-A"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"etag-2\"")
                    .set_body_json(serde_json::json!({
                        "manifestVersion": 4,
                        "deployments": [{
                            "deploymentId": "11111111-1111-1111-1111-111111111111",
                            "digest": Digest::sha256(b"x").as_str(),
                            "url": "https://fm.example/d/1",
                        }],
                    })),
            )
            .mount(&server)
            .await;

        match client(&server).sync_state("dev-A", None, &[]).await.unwrap() {
            SyncOutcome::Manifest { manifest, etag } => {
                assert_eq!(manifest.manifest_version, Some(4));
                assert_eq!(manifest.deployments.len(), 1);
                assert_eq!(etag.as_deref(), Some("\"etag-2\""));
            }
            other => panic!("expected manifest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bearer_token_is_attached_when_auth_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state"))
            .and(header("authorization", "Bearer tok-9"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = client(&server).with_auth(Arc::new(StaticToken("tok-9".into())));
        assert!(client.auth_enabled());
        let outcome = client.sync_state("dev-A", Some("\"e\""), &[]).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::NotModified));
    }

    #[tokio::test]
    async fn fetch_deployment_passes_digest_query() {
        let server = MockServer::start().await;
        let digest = Digest::sha256(b"yaml");
        Mock::given(method("GET"))
            .and(path("/device/dev-A/deployment/11111111-1111-1111-1111-111111111111"))
            .and(query_param("digest", digest.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"yaml".to_vec()))
            .mount(&server)
            .await;

        let id = DeploymentId::parse("11111111-1111-1111-1111-111111111111").unwrap();
        let bytes = client(&server).fetch_deployment("dev-A", id, &digest).await.unwrap();
        assert_eq!(bytes, b"yaml");
    }

    #[tokio::test]
    async fn post_status_hits_deployment_status_path() {
        let server = MockServer::start().await;
        let id = DeploymentId::new(Uuid::new_v4());
        Mock::given(method("POST"))
            .and(path(format!("/device/dev-A/deployment/{}/status", id)))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let status = DeploymentStatus {
            deployment_id: id,
            state: DeploymentPhase::Running,
            components: vec![],
            app_state: None,
        };
        client(&server).post_status("dev-A", &status).await.unwrap();
    }

    #[tokio::test]
    async fn server_error_is_a_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server).sync_state("dev-A", None, &[]).await.unwrap_err();
        match err {
            WfmError::Status { status, .. } => assert_eq!(status, 500),
            other => panic!("expected status error, got {:?}", other),
        }
    }
}
