use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use orchwatch_aggregator::{
    assemble,
    exporter::{self, LATENCY_QUANTILES},
    leaderboard::{HttpLeaderboard, ScorePoller},
    names::{HttpNameResolver, NameResolver, NoAliasResolver},
    server,
    settings::{AppArgs, Settings},
    storage::FileStorage,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AppArgs::parse();
    let settings = Settings::load(args.config.as_deref())?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prometheus = PrometheusBuilder::new()
        .set_quantiles(LATENCY_QUANTILES)?
        .install_recorder()?;
    export_build_info();
    exporter::describe();

    let resolver: Arc<dyn NameResolver> = match &settings.name_resolution.url {
        Some(url) => Arc::new(HttpNameResolver::new(
            url.clone(),
            Duration::from_millis(settings.name_resolution.timeout_ms),
            settings.name_resolution.requests_per_second,
        )?),
        None => Arc::new(NoAliasResolver),
    };
    let storage = Arc::new(FileStorage::new(&settings.storage_dir)?);
    let (writer, queue, state) = assemble(&settings, resolver, storage, prometheus);
    let snapshots = state.snapshots.clone();

    let listener = TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("listening on {}", settings.listen_addr))?;
    let app = server::router(state, settings.route_prefix());

    let shutdown = shutdown_listener()?;

    info!(
        listen_addr = %settings.listen_addr,
        api_path = settings.route_prefix(),
        storage_dir = %settings.storage_dir.display(),
        "orchwatch aggregator starting"
    );

    let server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = server::serve(listener, app, shutdown.clone()).await {
                error!(?err, "http server exited with error");
                shutdown.cancel();
            }
        }
    });

    let poller_task = if settings.leaderboard.enabled {
        let source = HttpLeaderboard::new(
            &settings.leaderboard.url,
            Duration::from_secs(settings.leaderboard.timeout_secs),
        )?;
        let poller = ScorePoller::new(
            Arc::new(source),
            queue.clone(),
            snapshots,
            Duration::from_secs(settings.leaderboard.poll_interval_secs),
        );
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = poller.run(shutdown).await {
                error!(?err, "leaderboard poller exited with error");
            }
        }))
    } else {
        None
    };

    let result = writer.run(shutdown.clone()).await;
    shutdown.cancel();

    let _ = server_task.await;
    if let Some(task) = poller_task {
        let _ = task.await;
    }

    result.context("cache writer failed")?;
    info!("orchwatch aggregator shutting down");

    Ok(())
}

fn shutdown_listener() -> anyhow::Result<CancellationToken> {
    let cancellation_token = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("sigterm listener failed")?;
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => cancellation_token.cancel(),
                _ = signal::ctrl_c() => cancellation_token.cancel(),
            }
        }
    });

    Ok(cancellation_token)
}

fn export_build_info() {
    let version = option_env!("BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let build_commit = option_env!("BUILD_COMMIT").unwrap_or("UNKNOWN");
    let build_date = option_env!("DATE").unwrap_or("UNKNOWN");
    let pkg_version = env!("CARGO_PKG_VERSION");

    metrics::gauge!(
        "orchwatch_aggregator_build_info",
        "version" => version,
        "commit" => build_commit,
        "date" => build_date,
        "pkg_version" => pkg_version
    )
    .set(1);
}
