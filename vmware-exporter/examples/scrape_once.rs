//! Runs a single scrape against a live endpoint and prints the exposition.
//!
//! ```text
//! VSPHERE_HOST=vcenter.example.com VSPHERE_USER=monitor VSPHERE_PASSWORD=secret \
//!     cargo run -p vmware-exporter --example scrape_once
//! ```

use std::sync::Arc;

use vmware_exporter::{Endpoint, MetricSink, ScrapeConfig, Scraper, VsphereConnector};

fn env(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{name} must be set").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let endpoint = Endpoint::new(
        env("VSPHERE_HOST")?,
        env("VSPHERE_USER")?,
        env("VSPHERE_PASSWORD")?,
    )
    .with_insecure(std::env::var("VSPHERE_INSECURE").is_ok_and(|v| v == "true"));
    let scraper = Scraper::new(
        Arc::new(VsphereConnector::new()),
        endpoint,
        ScrapeConfig::default(),
        Arc::new(MetricSink::new()),
    );

    let (report, exposition) = scraper.collect().await?;
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    print!("{exposition}");
    Ok(())
}
