use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, info, warn};

use super::traits::{SessionHandle, SessionProvider};
use crate::config::{UpstreamConfig, DEFAULT_USER_AGENT};
use crate::detect::response;
use crate::error::CaptureError;

/// Captures entity pages over plain HTTP. Each pooled session gets its own
/// client so cookies and connection reuse stay scoped to that session.
pub struct HttpSessionProvider {
    base_url: Url,
    headers: HashMap<String, String>,
    user_agents: HashMap<String, String>,
    request_timeout: Duration,
    clients: RwLock<HashMap<String, Client>>,
}

impl HttpSessionProvider {
    pub fn new(config: &UpstreamConfig, request_timeout: Duration) -> Result<Self> {
        let trimmed = config.base_url.trim_end_matches('/');
        let base_url =
            Url::parse(trimmed).map_err(|e| anyhow!("invalid upstream base url: {}", e))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("upstream base url {} cannot be a base", trimmed));
        }
        info!("http session provider targeting {}", base_url);
        Ok(Self {
            base_url,
            headers: config.headers.clone(),
            user_agents: config.user_agents.clone(),
            request_timeout,
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub fn entity_url(&self, entity_key: &str) -> Result<Url, CaptureError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CaptureError::Fatal("upstream base url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(entity_key);
        Ok(url)
    }

    fn user_agent(&self, profile: &str) -> &str {
        self.user_agents
            .get(profile)
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Client bound to `session`, built on first use.
    fn client_for(&self, session: &SessionHandle) -> Result<Client, CaptureError> {
        if let Some(client) = self.clients.read().get(&session.id) {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .cookie_store(true)
            .user_agent(self.user_agent(&session.profile))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| CaptureError::Fatal(format!("building client: {}", e)))?;
        debug!(
            "built client for session {} (profile {})",
            session.id, session.profile
        );
        Ok(self
            .clients
            .write()
            .entry(session.id.clone())
            .or_insert(client)
            .clone())
    }

    fn build_request(&self, client: &Client, url: Url) -> RequestBuilder {
        let mut req = client.get(url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    pub fn live_clients(&self) -> usize {
        self.clients.read().len()
    }
}

fn transport_error(e: reqwest::Error) -> CaptureError {
    if e.is_builder() {
        CaptureError::Fatal(e.to_string())
    } else {
        // Timeouts, connect failures and truncated bodies.
        CaptureError::Transient(e.to_string())
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn capture(
        &self,
        session: &SessionHandle,
        entity_key: &str,
    ) -> Result<Bytes, CaptureError> {
        let client = self.client_for(session)?;
        let url = self.entity_url(entity_key)?;
        debug!("capture entity={} session={} url={}", entity_key, session.id, url);

        let resp = self
            .build_request(&client, url)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(transport_error)?;

        if let Some(err) = response::to_capture_error(status, &body) {
            warn!(
                "capture entity={} session={} rejected: {}",
                entity_key, session.id, err
            );
            return Err(err);
        }
        Ok(body)
    }

    async fn discard(&self, session: &SessionHandle) {
        if self.clients.write().remove(&session.id).is_some() {
            debug!("dropped client for session {}", session.id);
        }
    }
}
