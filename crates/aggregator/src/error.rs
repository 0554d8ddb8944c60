use backon::{ExponentialBuilder, Retryable};
use reqwest::StatusCode;
use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persisted record {key} is corrupt: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage io error on {key}: {source}")]
    StorageIo {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("update queue is closed")]
    QueueClosed,
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Retries transient HTTP failures of `operation` with jittered exponential backoff.
pub async fn http_with_retry<F, Fut, T>(operation: F, label: &'static str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut op = operation;
    let attempts = AtomicUsize::new(0);
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(3)
        .with_jitter();

    (move || op())
        .retry(backoff)
        .when(should_retry)
        .notify(|err: &Error, delay: Duration| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(attempt, retry_in = ?delay, error = ?err, operation = label, "transient HTTP failure");
        })
        .await
}

pub(crate) fn should_retry(err: &Error) -> bool {
    match err {
        Error::Http(http_err) => {
            if http_err.is_timeout() || http_err.is_connect() {
                return true;
            }
            retryable_status(http_err.status())
        }
        _ => false,
    }
}

fn retryable_status(status: Option<StatusCode>) -> bool {
    match status {
        Some(code) => code.is_server_error() || code == StatusCode::TOO_MANY_REQUESTS,
        None => false,
    }
}
