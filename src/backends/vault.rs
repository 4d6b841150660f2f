//! HashiCorp Vault client covering the calls the decorator makes: logical
//! reads plus renew/revoke of its own token.

use super::{BackendError, SecretBackend, SecretPayload};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "vault";
const TOKEN_HEADER: &str = "X-Vault-Token";

pub struct VaultClient {
    base_url: String,
    token: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct LogicalResponse {
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

impl VaultClient {
    pub fn new(addr: &str, token: impl Into<String>) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: normalize_addr(BACKEND, addr)?,
            token: token.into(),
            client: Client::new(),
        })
    }

    /// Build a client whose token is read from `token_file`, trimmed of
    /// surrounding whitespace.
    pub async fn from_token_file(addr: &str, token_file: &Path) -> Result<Self, BackendError> {
        let raw = tokio::fs::read_to_string(token_file)
            .await
            .map_err(|source| BackendError::TokenFile {
                path: token_file.display().to_string(),
                source,
            })?;
        Self::new(addr, raw.trim())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(TOKEN_HEADER, &self.token)
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response, BackendError> {
        self.authed(request)
            .send()
            .await
            .map_err(|source| BackendError::Http {
                backend: BACKEND,
                path: path.to_string(),
                source,
            })
    }
}

#[async_trait]
impl SecretBackend for VaultClient {
    async fn read(&self, path: &str) -> Result<Option<SecretPayload>, BackendError> {
        info!("Fetching secret at {}", path);
        let response = self.send(path, self.client.get(self.url(path))).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("No secret stored at {}", path);
            return Ok(None);
        }
        let response = error_for_status(path, response).await?;

        let body: LogicalResponse = response.json().await.map_err(|e| BackendError::Decode {
            backend: BACKEND,
            path: path.to_string(),
            message: e.to_string(),
        })?;

        Ok(body.data.map(SecretPayload::new))
    }

    async fn renew_self(&self, increment_secs: u64) -> Result<(), BackendError> {
        let path = "auth/token/renew-self";
        let request = self
            .client
            .post(self.url(path))
            .json(&json!({ "increment": increment_secs }));
        let response = self.send(path, request).await?;
        error_for_status(path, response).await?;
        Ok(())
    }

    async fn revoke_self(&self) -> Result<(), BackendError> {
        info!("Revoking token");
        let path = "auth/token/revoke-self";
        let response = self.send(path, self.client.post(self.url(path))).await?;
        error_for_status(path, response).await?;
        Ok(())
    }
}

/// Validate a backend address and strip any trailing slash.
pub(crate) fn normalize_addr(backend: &'static str, addr: &str) -> Result<String, BackendError> {
    let parsed = Url::parse(addr).map_err(|e| BackendError::Address {
        backend,
        addr: addr.to_string(),
        message: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(BackendError::Address {
            backend,
            addr: addr.to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(addr.trim_end_matches('/').to_string())
}

async fn error_for_status(path: &str, response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        backend: BACKEND,
        path: path.to_string(),
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}
