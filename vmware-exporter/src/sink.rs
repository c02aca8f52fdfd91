//! Metric sink backed by a prometheus [`Registry`].
//!
//! Families are created lazily on the first observation of a name, with the
//! label schema of that first sample, and live as long as the sink. Values
//! are never expired: a label set keeps its last value until it is written
//! again or the process exits.
//!
//! The name to family map sits behind a read-write lock that is only taken
//! for writing when a family is created. Value updates go through the
//! family's own `GaugeVec`, which synchronises each label set independently.

use std::borrow::Cow;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use prometheus::core::Collector;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::error::SinkError;

/// Prefix of every family name.
pub const NAMESPACE: &str = "vmware";

/// Label names of VM-scoped families.
pub const VM_LABELS: &[&str] = &["uuid", "instance"];

/// Label names of the scrape duration family.
pub const COLLECTOR_LABELS: &[&str] = &["collector"];

/// Label names of the build info family.
pub const BUILD_INFO_LABELS: &[&str] = &["version"];

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// One observation destined for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Family name without the namespace prefix.
    pub name: String,
    /// Help text, used when the family is created.
    pub help: Cow<'static, str>,
    /// Label names, in order.
    pub label_names: &'static [&'static str],
    /// Label values, matching `label_names`.
    pub label_values: Vec<String>,
    /// Observed value.
    pub value: f64,
}

impl MetricSample {
    /// Creates a sample.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<Cow<'static, str>>,
        label_names: &'static [&'static str],
        label_values: Vec<String>,
        value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names,
            label_values,
            value,
        }
    }

    /// The namespaced family name.
    pub fn full_name(&self) -> String {
        format!("{NAMESPACE}_{}", self.name)
    }
}

/// A current label set and value, as returned by [`MetricSink::drain`].
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesValue {
    /// The namespaced family name.
    pub name: String,
    /// Label name and value pairs.
    pub labels: Vec<(String, String)>,
    /// Last observed value.
    pub value: f64,
}

impl SeriesValue {
    /// The value of label `name`, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

struct Family {
    gauges: GaugeVec,
    label_names: &'static [&'static str],
}

impl Family {
    fn set(&self, name: &str, sample: &MetricSample) -> Result<(), SinkError> {
        if self.label_names != sample.label_names {
            return Err(SinkError::SchemaMismatch {
                name: name.to_string(),
                expected: self.label_names.iter().map(|l| (*l).to_string()).collect(),
                actual: sample.label_names.iter().map(|l| (*l).to_string()).collect(),
            });
        }
        let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
        self.gauges
            .get_metric_with_label_values(&values)?
            .set(sample.value);
        Ok(())
    }
}

/// Process-wide store of labeled gauge families.
#[derive(Default)]
pub struct MetricSink {
    registry: Registry,
    families: RwLock<HashMap<String, Family>>,
}

impl fmt::Debug for MetricSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSink")
            .field("families", &self.family_count())
            .finish_non_exhaustive()
    }
}

impl MetricSink {
    /// Creates an empty sink with its own registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sample`, creating its family on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::SchemaMismatch`] if the family exists with other
    /// label names, or [`SinkError::Registry`] if prometheus rejects the
    /// family name or the label values.
    pub fn observe(&self, sample: &MetricSample) -> Result<(), SinkError> {
        let name = sample.full_name();
        {
            let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(family) = families.get(&name) {
                return family.set(&name, sample);
            }
        }

        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        let family = match families.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let gauges = GaugeVec::new(
                    Opts::new(entry.key().clone(), sample.help.clone()),
                    sample.label_names,
                )?;
                self.registry.register(Box::new(gauges.clone()))?;
                tracing::debug!("created metric family {}", entry.key());
                entry.insert(Family {
                    gauges,
                    label_names: sample.label_names,
                })
            }
        };
        let name = sample.full_name();
        family.set(&name, sample)
    }

    /// Forwards every current label set and value of every family to `out`,
    /// including label sets the latest scrape did not touch.
    pub fn drain<E: Extend<SeriesValue>>(&self, out: &mut E) {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        for (name, family) in families.iter() {
            for proto in family.gauges.collect() {
                out.extend(proto.get_metric().iter().map(|metric| SeriesValue {
                    name: name.clone(),
                    labels: metric
                        .get_label()
                        .iter()
                        .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                        .collect(),
                    value: metric.get_gauge().get_value(),
                }));
            }
        }
    }

    /// All current series, sorted by name and labels.
    pub fn snapshot(&self) -> Vec<SeriesValue> {
        let mut out = Vec::new();
        self.drain(&mut out);
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }

    /// Number of families created so far.
    pub fn family_count(&self) -> usize {
        self.families.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sets `vmware_exporter_build_info{version}` to 1.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the family cannot be created.
    pub fn register_build_info(&self, version: &str) -> Result<(), SinkError> {
        self.observe(&MetricSample::new(
            "exporter_build_info",
            "Build information of the exporter, value is always 1",
            BUILD_INFO_LABELS,
            vec![version.to_string()],
            1.0,
        ))
    }

    /// Registers the prometheus process collector (CPU, memory, file
    /// descriptors of this process).
    ///
    /// # Errors
    ///
    /// Returns the registry error if the collector is already registered.
    #[cfg(target_os = "linux")]
    pub fn register_process_collector(&self) -> Result<(), SinkError> {
        use prometheus::process_collector::ProcessCollector;
        self.registry.register(Box::new(ProcessCollector::for_self()))?;
        Ok(())
    }

    /// Process metrics are only collected on Linux.
    ///
    /// # Errors
    ///
    /// Never fails on this platform.
    #[cfg(not(target_os = "linux"))]
    pub fn register_process_collector(&self) -> Result<(), SinkError> {
        tracing::warn!("process metrics are not supported on this platform");
        Ok(())
    }

    /// Encodes every registered family in the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Encode`] if encoding fails.
    pub fn encode(&self) -> Result<String, SinkError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SinkError::Encode {
                reason: e.to_string(),
            })?;
        String::from_utf8(buffer).map_err(|e| SinkError::Encode {
            reason: e.to_string(),
        })
    }
}
