//! Firebase-style REST client: `GET {base}/{path}.json[?auth=token]`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use super::{RemoteStore, StoreError, StorePath, StoreResult};

/// Remote store reached over HTTPS.
#[derive(Clone, Debug)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpStore {
    /// Builds a client for `base_url` with a per-request timeout.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| StoreError::Transport {
                path: base_url.to_owned(),
                source,
            })?;
        let invalid = |message: String| StoreError::InvalidUrl {
            url: base_url.to_owned(),
            message,
        };
        let parsed = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("not a hierarchical URL".into()));
        }
        Ok(Self {
            client,
            base_url: parsed,
            auth_token,
        })
    }

    /// URL of `path`. Each segment is percent-encoded.
    pub fn url_for(&self, path: &StorePath) -> Url {
        let mut url = self.base_url.clone();
        if let Some((last, parents)) = path.segments().split_last() {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments
                    .pop_if_empty()
                    .extend(parents)
                    .push(&format!("{last}.json"));
            }
        }
        url
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn get_subtree(&self, path: &StorePath) -> StoreResult<Value> {
        let mut request = self.client.get(self.url_for(path));
        if let Some(token) = &self.auth_token {
            request = request.query(&[("auth", token)]);
        }
        let transport = |source| StoreError::Transport {
            path: path.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Http {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        tracing::debug!(path = %path, bytes = body.len(), "store read");
        serde_json::from_slice(&body).map_err(|err| StoreError::Decode {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    fn describe(&self) -> String {
        self.base_url.to_string()
    }
}
