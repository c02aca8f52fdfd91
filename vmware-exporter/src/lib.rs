//! # vmware-exporter
//!
//! Scrape pipeline that republishes vSphere virtual machine inventory and
//! performance counters as Prometheus metrics.
//!
//! Every scrape opens its own session against the endpoint, walks
//! datacenters and their virtual machines, collects basic and performance
//! metrics for each VM concurrently, and writes the result into a
//! process-wide [`MetricSink`] that the HTTP layer encodes on request.
//!
//! ## Key Properties
//!
//! - One session per scrape, always logged out at the end
//! - Partial results: a failing datacenter or VM never fails the scrape
//! - Bounded fan-out with a per-scrape deadline
//! - Last known values persist across scrapes until overwritten
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vmware_exporter::{Endpoint, MetricSink, ScrapeConfig, Scraper, VsphereConnector};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scraper = Scraper::new(
//!     Arc::new(VsphereConnector::new()),
//!     Endpoint::new("vcenter.example.com", "monitor", "secret"),
//!     ScrapeConfig::default(),
//!     Arc::new(MetricSink::new()),
//! );
//!
//! let (report, exposition) = scraper.collect().await?;
//! println!("collected {} VMs", report.vms_collected);
//! print!("{exposition}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Endpoint configuration, session open and close
//! - [`inventory`]: Datacenter and VM listing, batched property retrieval
//! - [`perf`]: Counter catalog and performance sampling
//! - [`translate`]: Counter key to metric name mapping
//! - [`sink`]: Labeled gauge registry and text exposition
//! - [`scrape`]: The scrape state machine
//! - [`soap`]: vim25 SOAP transport
//! - [`error`]: Error types

pub mod error;
pub mod inventory;
pub mod perf;
pub mod scrape;
pub mod session;
pub mod sink;
pub mod soap;
pub mod translate;

#[cfg(test)]
mod fake_sdk;

pub use error::{ExporterError, Result};
pub use inventory::{Datacenter, Instance, VirtualMachine};
pub use perf::{EntityMetric, MetricSeries, PerfQuerySpec};
pub use scrape::{ScrapeConfig, ScrapeReport, ScrapeState, Scraper};
pub use session::{Connector, Endpoint, Session, VsphereConnector};
pub use sink::{MetricSample, MetricSink, SeriesValue};
pub use soap::ManagedObjectRef;
