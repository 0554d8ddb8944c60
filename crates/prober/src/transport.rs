//! Node status transport: asks an orchestrator for its current quote.

use async_trait::async_trait;
use mockall::automock;
use orchwatch_types::{INSUFFICIENT_RESERVE, PriceInfo};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStatus {
    pub price_info: Option<PriceInfo>,
    pub version: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// Reachable, but refuses to quote for an unfunded sender.
    #[error("insufficient sender reserve")]
    InsufficientReserve,
    #[error("invalid service uri {0}")]
    InvalidUri(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("node refused: {0}")]
    Refused(String),
}

#[automock]
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn discover(&self, service_uri: &str) -> Result<NodeStatus, ProbeError>;
}

/// Service URIs are published without a scheme as often as with one.
pub fn service_url(service_uri: &str) -> Result<Url, ProbeError> {
    let trimmed = service_uri.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&candidate).map_err(|_| ProbeError::InvalidUri(service_uri.to_string()))
}

fn refusal(message: String) -> ProbeError {
    if message.to_lowercase().contains(INSUFFICIENT_RESERVE) {
        ProbeError::InsufficientReserve
    } else {
        ProbeError::Refused(message)
    }
}

pub struct HttpStatusProbe {
    client: reqwest::Client,
    status_path: String,
}

impl HttpStatusProbe {
    /// No retries and no pooled connections: each probe measures a cold request.
    pub fn new(
        status_path: impl Into<String>,
        request_timeout: Duration,
        accept_invalid_certs: bool,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            status_path: status_path.into(),
        })
    }
}

#[async_trait]
impl NodeProbe for HttpStatusProbe {
    async fn discover(&self, service_uri: &str) -> Result<NodeStatus, ProbeError> {
        let url = service_url(service_uri)?
            .join(&self.status_path)
            .map_err(|_| ProbeError::InvalidUri(service_uri.to_string()))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(refusal(format!("{status}: {}", body.trim())));
        }

        let node_status: NodeStatus =
            serde_json::from_str(&body).map_err(|err| ProbeError::Refused(format!("bad status body: {err}")))?;
        match node_status.error {
            Some(message) => Err(refusal(message)),
            None => Ok(node_status),
        }
    }
}
