//! One full scrape of a vSphere endpoint.
//!
//! A scrape walks `Idle → SessionOpen → Enumerating → Collecting → Flushing
//! → Closed`. Opening the session or listing datacenters failing ends the
//! scrape early with no samples written; everything after that degrades per
//! datacenter or per VM.
//!
//! Each VM gets two tasks, one turning the already-fetched properties into
//! basic samples and one sampling performance counters. Tasks are bounded by
//! a semaphore and send their samples over a channel to a single writer that
//! feeds the [`MetricSink`]. A cancellation token fires at the scrape
//! deadline and cuts every outstanding remote call short.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::inventory::{self, Instance, VirtualMachine};
use crate::perf::{EntityMetric, PerfQuerySpec};
use crate::session::{Connector, Endpoint, Session};
use crate::sink::{COLLECTOR_LABELS, MetricSample, MetricSink, VM_LABELS};
use crate::translate;

/// Default number of collection tasks allowed to run at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Default deadline of one scrape.
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(60);

/// Label value of the scrape duration family.
pub const COLLECTOR: &str = "vmware";

const SAMPLE_CHANNEL_CAPACITY: usize = 1024;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Scrape tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    /// Maximum collection tasks running at once. Zero is treated as one.
    pub max_concurrency: usize,
    /// Deadline of the whole scrape.
    pub scrape_timeout: Duration,
    /// Counter keys sampled in addition to the defaults.
    pub extra_counters: Vec<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            scrape_timeout: DEFAULT_SCRAPE_TIMEOUT,
            extra_counters: Vec::new(),
        }
    }
}

impl ScrapeConfig {
    /// Sets the concurrency ceiling.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the scrape deadline.
    #[must_use]
    pub fn with_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.scrape_timeout = timeout;
        self
    }

    /// Adds counter keys to sample on top of the defaults.
    #[must_use]
    pub fn with_extra_counters(mut self, counters: Vec<String>) -> Self {
        self.extra_counters = counters;
        self
    }
}

/// States of a scrape, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeState {
    /// Nothing done yet.
    #[default]
    Idle,
    /// Session established.
    SessionOpen,
    /// Walking datacenters and fetching VM properties.
    Enumerating,
    /// Waiting for per-VM collection tasks.
    Collecting,
    /// Writing the scrape duration.
    Flushing,
    /// Session released.
    Closed,
}

impl fmt::Display for ScrapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SessionOpen => "session_open",
            Self::Enumerating => "enumerating",
            Self::Collecting => "collecting",
            Self::Flushing => "flushing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of one scrape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScrapeReport {
    /// Last state entered before the scrape closed. `Flushing` for a scrape
    /// that got through collection; anything earlier means it was cut short.
    pub state: ScrapeState,
    /// Datacenters listed.
    pub datacenters_seen: usize,
    /// Datacenters skipped because VM listing or property fetch failed.
    pub datacenters_failed: usize,
    /// VMs whose samples were collected.
    pub vms_collected: usize,
    /// VMs skipped for lacking an instance UUID.
    pub vms_skipped: usize,
    /// VMs whose performance query failed or was cancelled.
    pub perf_failures: usize,
    /// Samples accepted by the sink.
    pub samples_written: usize,
    /// Wall-clock duration of the scrape.
    pub duration_seconds: f64,
    /// Whether the scrape deadline fired.
    pub deadline_exceeded: bool,
}

impl ScrapeReport {
    /// Whether the scrape got through collection.
    pub fn is_complete(&self) -> bool {
        self.state == ScrapeState::Flushing
    }

    fn enter(&mut self, state: ScrapeState) {
        tracing::debug!("scrape state {} -> {}", self.state, state);
        self.state = state;
    }
}

/// Computes `100 * used / capacity`, or 0 when `capacity` is not positive.
pub fn percent(used: f64, capacity: f64) -> f64 {
    if capacity <= 0.0 {
        return 0.0;
    }
    100.0 * used / capacity
}

/// Builds the summary, memory and guest disk samples of `vm`.
#[allow(clippy::cast_precision_loss)]
pub fn basic_samples(vm: &VirtualMachine, instance: &Instance) -> Vec<MetricSample> {
    let summary = &vm.summary;
    let runtime = &vm.runtime;
    let labels = instance.label_values("");
    let vm_sample = |name: &'static str, help: &'static str, value: f64| {
        MetricSample::new(name, help, VM_LABELS, labels.clone(), value)
    };

    let memory_usage = summary.quick_stats.guest_memory_usage as f64 * BYTES_PER_MB;
    let memory_capacity = runtime.max_memory_usage as f64 * BYTES_PER_MB;
    let mut samples = vec![
        vm_sample(
            "vm_cpu_usage",
            "vmware VM CPU usage in percent of the maximum usable CPU",
            percent(
                summary.quick_stats.overall_cpu_usage as f64,
                runtime.max_cpu_usage as f64,
            ),
        ),
        vm_sample(
            "vm_mem_total",
            "vmware VM configured memory in MB",
            summary.memory_size_mb as f64,
        ),
        vm_sample("vm_mem_usage", "vmware VM guest memory usage in bytes", memory_usage),
        vm_sample(
            "vm_mem_capacity",
            "vmware VM maximum memory usage in bytes",
            memory_capacity,
        ),
        vm_sample(
            "vm_mem_usage_percent",
            "vmware VM memory usage in percent of capacity",
            percent(memory_usage, memory_capacity),
        ),
    ];

    for disk in &vm.guest.disks {
        let path = inventory::sanitize_disk_path(&disk.disk_path);
        let labels = instance.label_values(&path);
        let free = disk.free_space as f64;
        let capacity = disk.capacity as f64;
        samples.extend([
            MetricSample::new(
                "vm_guest_disk_free",
                "vmware VM guest disk free space in bytes",
                VM_LABELS,
                labels.clone(),
                free,
            ),
            MetricSample::new(
                "vm_guest_disk_capacity",
                "vmware VM guest disk capacity in bytes",
                VM_LABELS,
                labels.clone(),
                capacity,
            ),
            MetricSample::new(
                "vm_guest_disk_free_percent",
                "vmware VM guest disk free space in percent of capacity",
                VM_LABELS,
                labels,
                percent(free, capacity),
            ),
        ]);
    }
    samples
}

/// Builds one sample per whole-VM performance series in `metrics`.
///
/// Per-device series (non-empty instance) are skipped.
#[allow(clippy::cast_precision_loss)]
pub fn performance_samples(instance: &Instance, metrics: &[EntityMetric]) -> Vec<MetricSample> {
    metrics
        .iter()
        .flat_map(|metric| metric.values.iter())
        .filter(|series| series.instance.is_empty())
        .filter_map(|series| {
            let value = series.latest()?;
            Some(MetricSample::new(
                translate::translate(&series.name),
                format!("vmware VM performance counter {}", series.name),
                VM_LABELS,
                instance.label_values(""),
                value as f64,
            ))
        })
        .collect()
}

/// The `scrape_collector_duration_seconds` sample for `elapsed`.
pub fn scrape_duration_sample(elapsed: Duration) -> MetricSample {
    MetricSample::new(
        "scrape_collector_duration_seconds",
        "Duration of the last scrape of the vSphere endpoint in seconds",
        COLLECTOR_LABELS,
        vec![COLLECTOR.to_string()],
        elapsed.as_secs_f64(),
    )
}

enum TaskOutcome {
    Basic,
    Performance,
    PerformanceFailed,
    PerformanceCancelled,
}

/// Everything a collection task needs, cloned into each task.
#[derive(Clone)]
struct TaskContext {
    session: Arc<dyn Session>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    samples: mpsc::Sender<MetricSample>,
    counters: Arc<[String]>,
    spec: PerfQuerySpec,
}

impl TaskContext {
    async fn send_all(&self, samples: Vec<MetricSample>) {
        for sample in samples {
            if self.samples.send(sample).await.is_err() {
                tracing::warn!("sample writer stopped, dropping samples");
                return;
            }
        }
    }

    /// Builds samples from properties already fetched. Makes no remote call,
    /// so it runs to completion even past the scrape deadline.
    async fn basic(self, vm: VirtualMachine, instance: Instance) -> TaskOutcome {
        let _permit = self.permits.acquire().await.ok();
        self.send_all(basic_samples(&vm, &instance)).await;
        TaskOutcome::Basic
    }

    async fn performance(self, vm: VirtualMachine, instance: Instance) -> TaskOutcome {
        let Some(Ok(_permit)) = self
            .cancel
            .run_until_cancelled(self.permits.acquire())
            .await
        else {
            return TaskOutcome::PerformanceCancelled;
        };
        let entities = [vm.reference];
        let sampled = self
            .cancel
            .run_until_cancelled(self.session.sample(&entities, &self.spec, &self.counters))
            .await;
        match sampled {
            Some(Ok(metrics)) => {
                self.send_all(performance_samples(&instance, &metrics)).await;
                TaskOutcome::Performance
            }
            Some(Err(e)) => {
                tracing::warn!(
                    "performance metrics of VM {} ({}) on {} failed: {e}",
                    vm.summary.name,
                    instance.uuid(),
                    self.session.host()
                );
                TaskOutcome::PerformanceFailed
            }
            None => {
                tracing::warn!(
                    "performance metrics of VM {} ({}) cancelled at scrape deadline",
                    vm.summary.name,
                    instance.uuid()
                );
                TaskOutcome::PerformanceCancelled
            }
        }
    }
}

/// Runs scrapes against one endpoint and writes the results to a sink.
pub struct Scraper {
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    config: ScrapeConfig,
    counters: Arc<[String]>,
    sink: Arc<MetricSink>,
}

impl fmt::Debug for Scraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scraper")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Scraper {
    /// Creates a scraper.
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: Endpoint,
        config: ScrapeConfig,
        sink: Arc<MetricSink>,
    ) -> Self {
        let counters = translate::counter_list(&config.extra_counters).into();
        Self {
            connector,
            endpoint,
            config,
            counters,
            sink,
        }
    }

    /// Runs one scrape and encodes the sink afterwards, stale series
    /// included.
    ///
    /// The scrape itself never fails the call; its outcome is in the
    /// returned report.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::Sink`](crate::ExporterError::Sink) if the
    /// registry cannot be encoded.
    pub async fn collect(&self) -> Result<(ScrapeReport, String)> {
        let report = self.scrape().await;
        let body = self.sink.encode()?;
        Ok((report, body))
    }

    /// Runs one scrape. Failures are logged and reflected in the report,
    /// never returned.
    pub async fn scrape(&self) -> ScrapeReport {
        let started = Instant::now();
        let mut report = ScrapeReport::default();
        let cancel = CancellationToken::new();
        let deadline = arm_deadline(&cancel, self.config.scrape_timeout);

        let host = &self.endpoint.host;
        match cancel
            .run_until_cancelled(self.connector.connect(&self.endpoint))
            .await
        {
            Some(Ok(session)) => {
                report.enter(ScrapeState::SessionOpen);
                let session: Arc<dyn Session> = Arc::from(session);
                self.run(&session, &cancel, &mut report, started).await;
                if let Err(e) = session.logout().await {
                    tracing::warn!("failed to log out of {host}: {e}");
                }
            }
            Some(Err(e)) => tracing::error!("failed to open session to {host}: {e}"),
            None => tracing::error!("opening session to {host} hit the scrape deadline"),
        }

        deadline.abort();
        report.deadline_exceeded = cancel.is_cancelled();
        report.duration_seconds = started.elapsed().as_secs_f64();
        tracing::debug!("scrape state {} -> {}", report.state, ScrapeState::Closed);
        if report.is_complete() {
            tracing::info!(
                "scraped {host} in {:.3}s: {} VMs, {} samples",
                report.duration_seconds,
                report.vms_collected,
                report.samples_written
            );
        }
        report
    }

    async fn run(
        &self,
        session: &Arc<dyn Session>,
        cancel: &CancellationToken,
        report: &mut ScrapeReport,
        started: Instant,
    ) {
        let host = session.host().to_string();
        report.enter(ScrapeState::Enumerating);
        let datacenters = match cancel.run_until_cancelled(session.datacenters()).await {
            Some(Ok(datacenters)) => datacenters,
            Some(Err(e)) => {
                tracing::error!("scrape of {host} aborted: {e}");
                return;
            }
            None => {
                tracing::error!("scrape of {host} aborted: listing datacenters hit the deadline");
                return;
            }
        };
        report.datacenters_seen = datacenters.len();

        let (tx, mut rx) = mpsc::channel::<MetricSample>(SAMPLE_CHANNEL_CAPACITY);
        let sink = Arc::clone(&self.sink);
        let writer = tokio::spawn(async move {
            let mut written: usize = 0;
            while let Some(sample) = rx.recv().await {
                match sink.observe(&sample) {
                    Ok(()) => written += 1,
                    Err(e) => tracing::warn!("dropping sample {}: {e}", sample.full_name()),
                }
            }
            written
        });

        let context = TaskContext {
            session: Arc::clone(session),
            permits: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            cancel: cancel.clone(),
            samples: tx,
            counters: Arc::clone(&self.counters),
            spec: PerfQuerySpec::default(),
        };
        let mut tasks = JoinSet::new();

        for datacenter in &datacenters {
            let vms = match cancel.run_until_cancelled(session.virtual_machines(datacenter)).await {
                Some(Ok(vms)) => vms,
                Some(Err(e)) => {
                    tracing::warn!("skipping datacenter {} on {host}: {e}", datacenter.name);
                    report.datacenters_failed += 1;
                    continue;
                }
                None => break,
            };
            let records = match cancel.run_until_cancelled(session.vm_properties(&vms)).await {
                Some(Ok(records)) => records,
                Some(Err(e)) => {
                    tracing::warn!("skipping datacenter {} on {host}: {e}", datacenter.name);
                    report.datacenters_failed += 1;
                    continue;
                }
                None => break,
            };
            tracing::debug!("datacenter {} has {} VMs", datacenter.name, records.len());

            for vm in records {
                let Some(instance) = Instance::from_vm(&vm) else {
                    tracing::warn!(
                        "skipping VM {} ({}) in datacenter {}: no instance UUID",
                        vm.summary.name,
                        vm.reference,
                        datacenter.name
                    );
                    report.vms_skipped += 1;
                    continue;
                };
                report.vms_collected += 1;
                tasks.spawn(context.clone().basic(vm.clone(), instance.clone()));
                tasks.spawn(context.clone().performance(vm, instance));
            }
        }
        if cancel.is_cancelled() {
            tracing::warn!(
                "scrape deadline hit while enumerating {host}, remaining datacenters skipped"
            );
        }
        drop(context);

        report.enter(ScrapeState::Collecting);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskOutcome::PerformanceFailed | TaskOutcome::PerformanceCancelled) => {
                    report.perf_failures += 1;
                }
                Ok(TaskOutcome::Basic | TaskOutcome::Performance) => {}
                Err(e) if e.is_panic() => tracing::error!("collection task panicked: {e}"),
                Err(e) => tracing::warn!("collection task did not finish: {e}"),
            }
        }
        report.samples_written = match writer.await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!("sample writer failed: {e}");
                0
            }
        };

        report.enter(ScrapeState::Flushing);
        match self.sink.observe(&scrape_duration_sample(started.elapsed())) {
            Ok(()) => report.samples_written += 1,
            Err(e) => tracing::warn!("failed to record scrape duration: {e}"),
        }
    }
}

fn arm_deadline(cancel: &CancellationToken, timeout: Duration) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tracing::warn!("scrape deadline of {timeout:?} exceeded, cancelling outstanding calls");
        cancel.cancel();
    })
}
