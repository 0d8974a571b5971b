mod cli;

use std::sync::Arc;

use clap::Parser;
use speedtest_client::{MeasurementProvider, SpeedtestClient};
use speedtest_common::error::SpeedtestError;
use speedtest_exporter::{
    AddressResolver, BuildInfo, CheckIpResolver, ExporterMetrics, ExporterState,
    SpeedtestCollector, exporter_router,
};
use speedtest_metrics::MetricsRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let build = BuildInfo::current();

    if cli.show_version {
        println!("Speedtest Prometheus exporter. v{}", build.version);
        return Ok(());
    }

    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("speedtest={}", cli.log_level).parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(version = build.version, "starting speedtest exporter");
    info!(build = %build, "build context");

    let registry = Arc::new(MetricsRegistry::new());
    let exporter_metrics = Arc::new(ExporterMetrics::register(registry.as_ref())?);

    info!("setting up speedtest client");
    let client = match SpeedtestClient::new(&cli.config_url(), &cli.server_url()).await {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "can't create the speedtest client");
            std::process::exit(1);
        }
    };
    let provider: Arc<dyn MeasurementProvider> = Arc::new(client);

    let resolver = CheckIpResolver::new(cli.resolver_url.clone());
    info!(endpoint = resolver.endpoint(), "public address resolver configured");
    let resolver: Arc<dyn AddressResolver> = Arc::new(resolver);

    let collector = SpeedtestCollector::new(provider, resolver, exporter_metrics)
        .with_timeout(cli.measurement_timeout());
    registry.register_collector(Arc::new(collector))?;
    info!("speedtest collector registered");

    let state = Arc::new(ExporterState::new(registry, cli.metrics_path.clone())?);
    let app = exporter_router(state);

    let addr = cli.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(SpeedtestError::from)?;
    info!(metrics_path = %cli.metrics_path, "speedtest exporter listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
