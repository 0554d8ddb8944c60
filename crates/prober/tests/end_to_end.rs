//! One prober cycle against an in-process aggregator.

use metrics_exporter_prometheus::PrometheusBuilder;
use orchwatch_aggregator::{
    assemble,
    names::NoAliasResolver,
    server,
    settings::{LeaderboardSettings, NameResolutionSettings, Settings as AggregatorSettings},
    storage::FileStorage,
};
use orchwatch_prober::{
    enrichment::{EnrichmentCache, MockHostLocator},
    pool::{MockTargetSource, TargetPool},
    prober::BoundedProber,
    report::{ReportClient, master_url},
    runner::{CycleRunner, ReporterIdentity},
    settings::MasterSettings,
    transport::{MockNodeProbe, NodeStatus, ProbeError},
};
use orchwatch_types::{GeoLocation, PriceInfo, SubmitResponse, Target};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "e2e-secret";

async fn spawn_aggregator(dir: &std::path::Path, shutdown: CancellationToken) -> SocketAddr {
    let settings = AggregatorSettings {
        log_level: "debug".into(),
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        api_path: "/api/master".into(),
        shared_secret: SECRET.into(),
        storage_dir: dir.to_path_buf(),
        liveness_expiry_secs: 86_400,
        idle_tick_ms: 20,
        snapshot_refresh_secs: 10,
        name_resolution: NameResolutionSettings::default(),
        leaderboard: LeaderboardSettings {
            enabled: false,
            ..Default::default()
        },
    };
    let storage = Arc::new(FileStorage::new(dir).unwrap());
    let prometheus = PrometheusBuilder::new().build_recorder().handle();
    let (writer, queue, state) = assemble(&settings, Arc::new(NoAliasResolver), storage, prometheus);

    let listener = TcpListener::bind(settings.listen_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(
        listener,
        server::router(state, settings.route_prefix()),
        shutdown.clone(),
    ));
    tokio::spawn(writer.run(shutdown));
    queue.sync().await.unwrap();
    addr
}

fn runner(addr: SocketAddr, key: &str) -> CycleRunner {
    let mut source = MockTargetSource::new();
    source.expect_fetch_targets().returning(|| {
        Ok(vec![
            Target::new("0xABC", "https://10.1.1.1:8935"),
            Target::new("0xdef", "https://10.1.1.2:8935"),
            Target::new("0xfee", "https://10.1.1.3:8935"),
        ])
    });
    let pool = TargetPool::new(Arc::new(source), Duration::from_secs(60));

    let mut locator = MockHostLocator::new();
    locator.expect_locate().returning(|_| {
        Ok(Some(GeoLocation {
            latitude: 50.0,
            longitude: 8.0,
        }))
    });
    let enrichment = EnrichmentCache::new(Arc::new(locator), Duration::from_secs(60), "fra-1");

    let mut probe = MockNodeProbe::new();
    probe.expect_discover().returning(|uri| match uri {
        "https://10.1.1.1:8935" => Ok(NodeStatus {
            price_info: Some(PriceInfo {
                price_per_unit: 1.0,
                pixels_per_unit: 1000.0,
            }),
            version: Some("0.7.2".into()),
            error: None,
        }),
        "https://10.1.1.2:8935" => Err(ProbeError::Refused("connection refused".into())),
        _ => Err(ProbeError::InsufficientReserve),
    });
    let prober = BoundedProber::new(
        Arc::new(probe),
        Arc::new(enrichment),
        2,
        Duration::from_secs(1),
    );

    let master = MasterSettings {
        host: "127.0.0.1".into(),
        port: addr.port(),
        path: "/api/master/collectStats".into(),
        tls: true,
    };
    let sink = ReportClient::new(master_url(&master).unwrap(), Duration::from_secs(5)).unwrap();

    CycleRunner::new(
        pool,
        prober,
        Arc::new(sink),
        ReporterIdentity {
            tag: "fra-1".into(),
            region: "eu".into(),
            external_regions: vec!["FRA".into()],
            key: key.into(),
        },
        Duration::from_secs(60),
        Duration::from_millis(10),
    )
}

async fn full_snapshot(addr: SocketAddr) -> Value {
    reqwest::get(format!("http://{addr}/api/master/json/full"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cycle_lands_in_aggregator_cache() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let addr = spawn_aggregator(dir.path(), shutdown.clone()).await;

    let summary = runner(addr, SECRET).run_cycle().await;
    assert_eq!(summary.reported, 2);
    assert_eq!(summary.response, Some(SubmitResponse::Accepted));

    // the writer applies asynchronously; poll the published snapshot
    let mut snapshot = Value::Null;
    for _ in 0..100 {
        snapshot = full_snapshot(addr).await;
        if snapshot.as_object().is_some_and(|nodes| nodes.len() == 2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let ok = &snapshot["0xabc"];
    assert!(ok["regionalStats"]["eu"]["latestLatency"].as_f64().unwrap() > 0.0);
    assert_eq!(ok["instances"]["10.1.1.1"]["price"].as_f64(), Some(0.001));
    assert_eq!(ok["instances"]["10.1.1.1"]["latitude"].as_f64(), Some(50.0));
    assert!(ok["instances"]["10.1.1.1"]["probedFrom"]["fra-1"].is_i64());

    let down = &snapshot["0xdef"]["regionalStats"]["eu"];
    assert_eq!(down["latestLatency"].as_f64(), Some(0.0));
    assert!(snapshot.get("0xfee").is_none());

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let addr = spawn_aggregator(dir.path(), shutdown.clone()).await;

    let summary = runner(addr, "not-the-secret").run_cycle().await;
    assert_eq!(summary.response, Some(SubmitResponse::Rejected));
    assert_eq!(full_snapshot(addr).await, serde_json::json!({}));

    shutdown.cancel();
}
