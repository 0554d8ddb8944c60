#![allow(dead_code)]

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use orchwatch_aggregator::{
    assemble,
    names::NoAliasResolver,
    server,
    settings::{LeaderboardSettings, NameResolutionSettings, Settings},
    storage::FileStorage,
    writer::{CacheWriter, UpdateQueue},
};
use serde_json::{Value, json};
use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, OnceLock},
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub const SECRET: &str = "integration-secret";

/// The recorder is process wide, so every test in a binary shares it.
pub fn prometheus() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

pub fn settings(storage_dir: &Path) -> Settings {
    let settings = Settings {
        log_level: "debug".into(),
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        api_path: "/api/master".into(),
        shared_secret: SECRET.into(),
        storage_dir: storage_dir.to_path_buf(),
        liveness_expiry_secs: 86_400,
        idle_tick_ms: 20,
        snapshot_refresh_secs: 10,
        name_resolution: NameResolutionSettings::default(),
        leaderboard: LeaderboardSettings {
            enabled: false,
            ..Default::default()
        },
    };
    settings.validate().expect("test settings are valid");
    settings
}

pub struct TestServer {
    pub base_url: String,
    pub queue: UpdateQueue,
    pub shutdown: CancellationToken,
    pub server: JoinHandle<std::io::Result<()>>,
    /// Writer not yet started; see [`TestServer::start_writer`].
    pub writer: Option<CacheWriter>,
}

impl TestServer {
    pub async fn spawn(storage_dir: &Path) -> Self {
        let settings = settings(storage_dir);
        let storage = Arc::new(FileStorage::new(storage_dir).unwrap());
        let (writer, queue, state) =
            assemble(&settings, Arc::new(NoAliasResolver), storage, prometheus());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = server::router(state, settings.route_prefix());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server::serve(listener, app, shutdown.clone()));

        Self {
            base_url: format!("http://{addr}/api/master"),
            queue,
            shutdown,
            server,
            writer: Some(writer),
        }
    }

    pub fn start_writer(&mut self) -> JoinHandle<orchwatch_aggregator::Result<()>> {
        let writer = self.writer.take().expect("writer already started");
        tokio::spawn(writer.run(self.shutdown.clone()))
    }

    /// Starts the writer and waits until persisted state is loaded.
    pub async fn start_ready(&mut self) -> JoinHandle<orchwatch_aggregator::Result<()>> {
        let handle = self.start_writer();
        self.queue.sync().await.unwrap();
        handle
    }

    pub async fn post_report(&self, body: &Value) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("{}/collectStats", self.base_url))
            .json(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    pub async fn get_json(&self, path: &str) -> Value {
        reqwest::get(format!("{}{path}", self.base_url))
            .await
            .unwrap()
            .error_for_status()
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    pub async fn get_text(&self, path: &str) -> String {
        reqwest::get(format!("{}{path}", self.base_url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }
}

pub fn report(nodes: Value, region: &str) -> Value {
    json!({
        "batchResults": nodes,
        "tag": format!("{region}-prober"),
        "key": SECRET,
        "region": region,
        "externalRegions": ["FRA"]
    })
}
