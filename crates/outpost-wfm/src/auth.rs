use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::WfmError;

/// Abstraction over bearer-token acquisition; enables test injection.
/// No component outside this crate knows whether auth is enabled.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, WfmError>;
}

/// OAuth2 client-credentials flow against the token endpoint received during
/// onboarding (or configured statically). Tokens are cached until shortly
/// before expiry.
pub struct ClientCredentialsTokenProvider {
    client_id: String,
    client_secret: String,
    token_url: String,
    client: reqwest::Client,
    cache: Mutex<Option<(String, Instant)>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn token(&self) -> Result<String, WfmError> {
        {
            let guard = self.cache.lock().await;
            if let Some((tok, expiry)) = guard.as_ref() {
                if Instant::now() < *expiry {
                    return Ok(tok.clone());
                }
            }
        }

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];
        let resp = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| WfmError::Auth(format!("token request: {}", e)))?;
        if !resp.status().is_success() {
            return Err(WfmError::Auth(format!(
                "token endpoint returned HTTP {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| WfmError::Auth(format!("token decode: {}", e)))?;

        let tok = body["access_token"]
            .as_str()
            .ok_or_else(|| WfmError::Auth(format!("no access_token in response: {}", body)))?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));

        *self.cache.lock().await = Some((tok.clone(), expiry));
        Ok(tok)
    }
}

/// Fixed token, used in tests.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, WfmError> {
        Ok(self.0.clone())
    }
}
