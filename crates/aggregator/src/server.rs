use crate::writer::{SnapshotReceiver, UpdateQueue};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use orchwatch_types::{NodeReport, StatsReport, SubmitResponse};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state for axum handlers.
pub struct AppState {
    pub queue: UpdateQueue,
    pub snapshots: SnapshotReceiver,
    pub ready: Arc<AtomicBool>,
    pub shared_secret: String,
    pub prometheus: PrometheusHandle,
}

/// Builds the API routes nested under `prefix` (e.g. `/api/master`).
pub fn router(state: Arc<AppState>, prefix: &str) -> Router {
    let api = Router::new()
        .route("/collectStats", post(collect_stats_handler))
        .route("/prometheus", get(metrics_handler))
        .route("/json", get(lite_json_handler))
        .route("/json/full", get(full_json_handler))
        .route("/healthz", get(healthz_handler));

    let prefix = prefix.trim_end_matches('/');
    let app = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    };
    app.with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
}

/// Report body as received; every field is checked before anything is queued.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest {
    batch_results: Option<BTreeMap<String, NodeReport>>,
    tag: Option<String>,
    key: Option<String>,
    region: Option<String>,
    #[serde(alias = "livepeer_regions")]
    external_regions: Option<Vec<String>>,
}

impl ReportRequest {
    fn authenticate(self, shared_secret: &str) -> Result<StatsReport, &'static str> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        let (Some(batch_results), Some(tag), Some(key), Some(region), Some(external_regions)) = (
            self.batch_results,
            present(self.tag),
            present(self.key),
            present(self.region),
            self.external_regions,
        ) else {
            return Err("malformed report");
        };

        if !constant_time_eq(&key, shared_secret) {
            return Err("unauthorized");
        }

        Ok(StatsReport {
            batch_results,
            tag,
            key,
            region,
            external_regions,
        })
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}

fn rejected(status: StatusCode) -> (StatusCode, Json<SubmitResponse>) {
    metrics::counter!("orchwatch_reports_rejected").increment(1);
    (status, Json(SubmitResponse::Rejected))
}

/// POST /collectStats - queue a prober's batch for the writer.
async fn collect_stats_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> (StatusCode, Json<SubmitResponse>) {
    if !state.ready.load(Ordering::Acquire) {
        return (StatusCode::OK, Json(SubmitResponse::Busy));
    }

    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "unparsable report body");
            return rejected(StatusCode::BAD_REQUEST);
        }
    };

    let report = match request.authenticate(&state.shared_secret) {
        Ok(report) => report,
        Err(reason) => {
            warn!(reason, "report refused");
            return rejected(StatusCode::OK);
        }
    };

    let (tag, region) = (report.tag.clone(), report.region.clone());
    match state.queue.submit_report(report) {
        Ok(count) => {
            debug!(%tag, %region, nodes = count, "report queued");
            metrics::counter!("orchwatch_reports_accepted").increment(1);
            (StatusCode::OK, Json(SubmitResponse::Accepted))
        }
        Err(err) => {
            error!(?err, "update queue unavailable");
            rejected(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// GET /prometheus - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
}

/// GET /json - cache snapshot without measurement windows.
async fn lite_json_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.snapshots.borrow().lite_json.clone();
    ([(header::CONTENT_TYPE, "application/json")], body)
}

/// GET /json/full - cache snapshot including measurement windows.
async fn full_json_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    match snapshot.full_json() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], body),
        Err(err) => {
            error!(?err, "encoding snapshot");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - ok once persisted state is loaded.
async fn healthz_handler(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "loading")
    }
}
