//! Consul KV client. Values are fetched with `?raw` so the body is the stored
//! bytes, not the base64 JSON envelope.

use super::vault::normalize_addr;
use super::{BackendError, ConfigBackend};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "consul";
const TOKEN_HEADER: &str = "X-Consul-Token";

pub struct ConsulClient {
    base_url: Url,
    token: Option<String>,
    client: Client,
}

impl ConsulClient {
    pub fn new(addr: &str, token: Option<String>) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: Url::parse(&normalize_addr(BACKEND, addr)?).map_err(|e| {
                BackendError::Address {
                    backend: BACKEND,
                    addr: addr.to_string(),
                    message: e.to_string(),
                }
            })?,
            token: token.filter(|t| !t.is_empty()),
            client: Client::new(),
        })
    }

    /// `<addr>/v1/kv/<key>?raw`, each key segment percent-encoded.
    fn url(&self, key: &str) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::Address {
                backend: BACKEND,
                addr: self.base_url.to_string(),
                message: "address cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(["v1", "kv"])
            .extend(key.trim_start_matches('/').split('/'));
        url.set_query(Some("raw"));
        Ok(url)
    }
}

#[async_trait]
impl ConfigBackend for ConsulClient {
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        info!("Fetching consul value at {}", path);

        let mut request = self.client.get(self.url(path)?);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|source| BackendError::Http {
            backend: BACKEND,
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("No KV pair at {}", path);
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                backend: BACKEND,
                path: path.to_string(),
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let bytes = response.bytes().await.map_err(|source| BackendError::Http {
            backend: BACKEND,
            path: path.to_string(),
            source,
        })?;
        Ok(Some(bytes.to_vec()))
    }
}
