//! Prometheus exporter for vSphere virtual machines.
//!
//! Every request to the metrics path runs one scrape of the configured
//! endpoint and answers with the current contents of the metric registry.

mod server;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vmware_exporter::{Endpoint, MetricSink, ScrapeConfig, Scraper, VsphereConnector};

/// vmware-exporter: vSphere VM metrics for Prometheus.
#[derive(Parser, Debug)]
#[command(name = "vmware-exporter", version, about)]
struct Cli {
    /// vCenter or ESXi host, optionally with a port.
    #[arg(long, env = "VSPHERE_HOST")]
    vsphere_host: String,

    /// Login user.
    #[arg(long, env = "VSPHERE_USER")]
    vsphere_user: String,

    /// Login password.
    #[arg(long, env = "VSPHERE_PASSWORD", hide_env_values = true)]
    vsphere_password: String,

    /// Skip TLS certificate verification.
    #[arg(long, env = "VSPHERE_INSECURE")]
    insecure: bool,

    /// Port to listen on.
    #[arg(long, env = "VMWARE_EXPORTER_PORT", default_value = "9272")]
    listen_port: u16,

    /// Path the metrics are served on.
    #[arg(
        long,
        env = "VMWARE_EXPORTER_METRICS_PATH",
        default_value = "/metrics",
        value_parser = parse_metrics_path
    )]
    metrics_path: String,

    /// Also export metrics of the exporter process itself.
    #[arg(long, env = "VMWARE_EXPORTER_PROCESS_METRICS")]
    process_metrics: bool,

    /// Maximum collection tasks running at once.
    #[arg(long, env = "VMWARE_EXPORTER_MAX_CONCURRENCY", default_value = "32")]
    max_concurrency: usize,

    /// Deadline of one scrape, in seconds.
    #[arg(long, env = "VMWARE_EXPORTER_SCRAPE_TIMEOUT", default_value = "60")]
    scrape_timeout_secs: u64,

    /// Timeout of each request to the endpoint, in seconds.
    #[arg(long, env = "VMWARE_EXPORTER_REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Extra performance counter to sample (`group.counter.rollup`).
    #[arg(
        long = "perf-counter",
        env = "VMWARE_EXPORTER_PERF_COUNTERS",
        value_delimiter = ','
    )]
    perf_counters: Vec<String>,

    /// Log filter directive.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.vsphere_host, &self.vsphere_user, &self.vsphere_password)
            .with_insecure(self.insecure)
    }

    fn scrape_config(&self) -> ScrapeConfig {
        ScrapeConfig::default()
            .with_max_concurrency(self.max_concurrency)
            .with_scrape_timeout(Duration::from_secs(self.scrape_timeout_secs))
            .with_extra_counters(self.perf_counters.clone())
    }
}

fn parse_metrics_path(path: &str) -> Result<String, String> {
    if !path.starts_with('/') {
        return Err("must start with '/'".to_string());
    }
    if server::RESERVED_PATHS.contains(&path) {
        return Err(format!("{path} is reserved"));
    }
    Ok(path.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        tracing::error!("exporter failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let sink = Arc::new(MetricSink::new());
    sink.register_build_info(env!("CARGO_PKG_VERSION"))?;
    if cli.process_metrics {
        sink.register_process_collector()?;
    }

    let endpoint = cli.endpoint();
    tracing::info!("exporting {endpoint:?}");
    let connector =
        VsphereConnector::new().with_request_timeout(Duration::from_secs(cli.request_timeout_secs));
    let scraper = Scraper::new(Arc::new(connector), endpoint, cli.scrape_config(), sink);

    let app = server::router(server::AppState::new(scraper, cli.metrics_path.clone()));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.listen_port)).await?;
    tracing::info!(
        "listening on {}, metrics at {}",
        listener.local_addr()?,
        cli.metrics_path
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("exporter stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
