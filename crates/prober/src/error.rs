use backon::{ExponentialBuilder, Retryable};
use reqwest::StatusCode;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tracing::warn;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("population query failed: {0}")]
    Population(String),
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("dns lookup failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected aggregator response ({status}): {body}")]
    UnexpectedResponse { status: StatusCode, body: String },
}

/// Retries transient HTTP failures of `operation` with jittered exponential backoff.
pub async fn http_with_retry<F, Fut, T>(operation: F, label: &'static str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(3)
        .with_jitter();

    operation
        .retry(backoff)
        .when(should_retry)
        .notify(|err: &Error, delay: Duration| {
            warn!(retry_in = ?delay, error = ?err, operation = label, "transient HTTP failure");
        })
        .await
}

pub(crate) fn should_retry(err: &Error) -> bool {
    match err {
        Error::Http(http_err) => {
            http_err.is_timeout() || http_err.is_connect() || retryable_status(http_err.status())
        }
        Error::UnexpectedResponse { status, .. } => retryable_status(Some(*status)),
        _ => false,
    }
}

fn retryable_status(status: Option<StatusCode>) -> bool {
    status.is_some_and(|code| code.is_server_error() || code == StatusCode::TOO_MANY_REQUESTS)
}
