use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use orchwatch_prober::{
    enrichment::{EnrichmentCache, NetLocator},
    pool::{SubgraphSource, TargetPool},
    prober::BoundedProber,
    report::{ReportClient, master_url},
    runner::{CycleRunner, ReporterIdentity},
    settings::{AppArgs, Settings},
    transport::HttpStatusProbe,
};
use std::{sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const ENRICHMENT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AppArgs::parse();
    let settings = Settings::load(args.config.as_deref())?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    PrometheusBuilder::new()
        .with_http_listener(settings.metrics_addr)
        .install()
        .context("installing metrics exporter")?;
    export_build_info();

    let source = SubgraphSource::new(
        settings.population.url.clone(),
        Duration::from_secs(settings.population.timeout_secs),
    )?;
    let pool = TargetPool::new(Arc::new(source), settings.population_refresh());

    let locator = NetLocator::new(
        settings.enrichment.geo_url.clone(),
        settings.enrichment.geo_token.clone(),
        Duration::from_millis(settings.enrichment.timeout_ms),
    )?;
    let enrichment = Arc::new(EnrichmentCache::new(
        Arc::new(locator),
        settings.enrichment_ttl(),
        settings.tag.clone(),
    ));
    let monitor = enrichment.spawn_monitor(ENRICHMENT_MONITOR_INTERVAL);

    let transport = HttpStatusProbe::new(
        settings.probe.status_path.clone(),
        settings.deadline(),
        settings.probe.accept_invalid_certs,
    )?;
    let prober = BoundedProber::new(
        Arc::new(transport),
        enrichment,
        settings.probe.concurrency,
        settings.deadline(),
    );

    let sink = ReportClient::new(master_url(&settings.master)?, SUBMIT_TIMEOUT)?;
    info!(
        tag = %settings.tag,
        region = %settings.region,
        master = %sink.url(),
        concurrency = settings.probe.concurrency,
        "orchwatch prober starting"
    );

    let identity = ReporterIdentity {
        tag: settings.tag.clone(),
        region: settings.region.clone(),
        external_regions: settings.external_regions.clone(),
        key: settings.shared_secret.clone(),
    };
    let runner = CycleRunner::new(
        pool,
        prober,
        Arc::new(sink),
        identity,
        settings.round(),
        settings.sleep(),
    );

    let shutdown = shutdown_listener()?;
    runner.run(shutdown).await;
    monitor.abort();

    info!("orchwatch prober shutting down");
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
        "orchwatch_prober_build_info",
        "version" => version,
        "commit" => build_commit,
        "date" => build_date,
        "pkg_version" => pkg_version
    )
    .set(1);
}
