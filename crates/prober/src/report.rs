//! Uploads a cycle's batch to the aggregator.

use crate::{
    error::{Error, Result, http_with_retry},
    settings::MasterSettings,
};
use async_trait::async_trait;
use mockall::automock;
use orchwatch_types::{StatsReport, SubmitResponse};
use std::time::Duration;
use url::Url;

/// Plain http for loopback aggregators or when TLS is switched off.
pub fn master_url(master: &MasterSettings) -> Result<Url> {
    let local = matches!(master.host.as_str(), "localhost" | "127.0.0.1");
    let scheme = if master.tls && !local { "https" } else { "http" };
    Ok(Url::parse(&format!(
        "{scheme}://{}:{}{}",
        master.host, master.port, master.path
    ))?)
}

#[automock]
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, report: &StatsReport) -> Result<SubmitResponse>;
}

pub struct ReportClient {
    client: reqwest::Client,
    url: Url,
}

impl ReportClient {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn post(&self, report: &StatsReport) -> Result<SubmitResponse> {
        let response = self.client.post(self.url.clone()).json(report).send().await?;
        let status = response.status();
        let body = response.text().await?;

        body.parse::<SubmitResponse>()
            .map_err(|_| Error::UnexpectedResponse { status, body })
    }
}

#[async_trait]
impl ReportSink for ReportClient {
    async fn submit(&self, report: &StatsReport) -> Result<SubmitResponse> {
        http_with_retry(|| self.post(report), "submit_report").await
    }
}
