//! Performance sampling through the vim25 `PerformanceManager`.
//!
//! Sampling is a two-step protocol:
//!
//! 1. Counter names (`group.counter.rollup`, e.g. `cpu.usage.average`) are
//!    resolved to the endpoint's numeric counter ids through a
//!    [`CounterCatalog`], and `QueryPerf` pulls the raw id-keyed series.
//! 2. The raw series are converted back to named [`MetricSeries`] using the
//!    same catalog.
//!
//! The catalog is loaded once per session and shared by every sampling call
//! of that session.

use std::collections::HashMap;

use roxmltree::Node;

use crate::error::{SampleError, SoapError};
use crate::inventory;
use crate::session::ServiceContent;
use crate::soap::{self, ManagedObjectRef, SoapClient};

/// The endpoint's default real-time sampling interval, in seconds.
pub const REALTIME_INTERVAL_SECS: u32 = 20;

/// Output format requested from `QueryPerf`. Only typed
/// `PerfMetricIntSeries` replies are parsed.
const QUERY_FORMAT: &str = "normal";

/// Fixed parameters of a performance query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfQuerySpec {
    /// Maximum samples per series.
    pub max_sample: u32,
    /// Sampling interval id, in seconds.
    pub interval_id: u32,
}

impl Default for PerfQuerySpec {
    /// Latest real-time sample only.
    fn default() -> Self {
        Self {
            max_sample: 1,
            interval_id: REALTIME_INTERVAL_SECS,
        }
    }
}

/// One entry of the endpoint's counter catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterInfo {
    /// Numeric counter id.
    pub key: i32,
    /// Group key, e.g. `cpu`.
    pub group: String,
    /// Counter key, e.g. `usage`.
    pub name: String,
    /// Rollup type, e.g. `average`.
    pub rollup: String,
}

impl CounterInfo {
    /// The `group.counter.rollup` key of this counter.
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.group, self.name, self.rollup)
    }
}

/// Bidirectional lookup between counter names and ids.
#[derive(Debug, Clone, Default)]
pub struct CounterCatalog {
    by_name: HashMap<String, i32>,
    by_key: HashMap<i32, String>,
}

impl CounterCatalog {
    /// Builds a catalog from the endpoint's counter descriptions.
    pub fn from_counters(counters: impl IntoIterator<Item = CounterInfo>) -> Self {
        let mut catalog = Self::default();
        for counter in counters {
            let name = counter.full_name();
            catalog.by_name.insert(name.clone(), counter.key);
            catalog.by_key.insert(counter.key, name);
        }
        catalog
    }

    /// Counter id of `name`.
    pub fn id(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    /// Counter name of `id`.
    pub fn name(&self, id: i32) -> Option<&str> {
        self.by_key.get(&id).map(String::as_str)
    }

    /// Number of known counters.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Resolves every name in `names` to its counter id.
    ///
    /// # Errors
    ///
    /// Returns [`SampleError::UnknownCounter`] for the first name the
    /// endpoint does not know.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<i32>, SampleError> {
        names
            .iter()
            .map(|name| {
                self.id(name)
                    .ok_or_else(|| SampleError::UnknownCounter { name: name.clone() })
            })
            .collect()
    }
}

/// Id-keyed series as returned by `QueryPerf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSeries {
    /// Numeric counter id.
    pub counter_id: i32,
    /// Sub-device instance; empty for the whole-entity aggregate.
    pub instance: String,
    /// Sample values, oldest first.
    pub values: Vec<i64>,
}

/// All raw series of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntityMetric {
    /// The sampled entity.
    pub entity: ManagedObjectRef,
    /// Series returned for it.
    pub series: Vec<RawSeries>,
}

/// A named counter series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSeries {
    /// Raw `group.counter.rollup` key.
    pub name: String,
    /// Sub-device instance; empty for the whole-entity aggregate.
    pub instance: String,
    /// Sample values, oldest first.
    pub values: Vec<i64>,
}

impl MetricSeries {
    /// The most recent sample, if any.
    pub fn latest(&self) -> Option<i64> {
        self.values.last().copied()
    }
}

/// All named series of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetric {
    /// The sampled entity.
    pub entity: ManagedObjectRef,
    /// Named series for it.
    pub values: Vec<MetricSeries>,
}

/// Loads the performance counter catalog of the endpoint.
///
/// # Errors
///
/// Returns the transport or parse error of the property collector call.
pub async fn load_catalog(
    client: &SoapClient,
    content: &ServiceContent,
) -> Result<CounterCatalog, SoapError> {
    let objects = format!(
        "<objectSet>{}<skip>false</skip></objectSet>",
        content.perf_manager.to_xml("obj")
    );
    let spec = inventory::spec_set("PerformanceManager", &["perfCounter"], &objects);
    let pages =
        inventory::retrieve(client, &content.property_collector, &spec, parse_counters).await?;
    let catalog = CounterCatalog::from_counters(pages.into_iter().flatten());
    tracing::debug!("loaded {} performance counters", catalog.len());
    Ok(catalog)
}

/// Samples `counters` for every entity in `entities`.
///
/// # Errors
///
/// Returns [`SampleError::UnknownCounter`] if a counter name is not in the
/// catalog and [`SampleError::Query`] if the query itself fails.
pub async fn sample(
    client: &SoapClient,
    content: &ServiceContent,
    catalog: &CounterCatalog,
    entities: &[ManagedObjectRef],
    spec: &PerfQuerySpec,
    counters: &[String],
) -> Result<Vec<EntityMetric>, SampleError> {
    let ids = catalog.resolve(counters)?;
    let body = query_perf(&content.perf_manager, entities, spec, &ids);
    let raw = async {
        let text = client.call(&body).await?;
        parse_query_perf(&text)
    }
    .await
    .map_err(|source| SampleError::Query {
        entity: describe(entities),
        source,
    })?;
    Ok(to_metric_series(catalog, raw))
}

/// Converts id-keyed series to named series.
///
/// Series whose counter id is missing from the catalog, or which carry no
/// values, are dropped.
pub fn to_metric_series(catalog: &CounterCatalog, raw: Vec<RawEntityMetric>) -> Vec<EntityMetric> {
    raw.into_iter()
        .map(|metric| {
            let values = metric
                .series
                .into_iter()
                .filter(|series| !series.values.is_empty())
                .filter_map(|series| match catalog.name(series.counter_id) {
                    Some(name) => Some(MetricSeries {
                        name: name.to_string(),
                        instance: series.instance,
                        values: series.values,
                    }),
                    None => {
                        tracing::debug!(
                            "dropping series of unknown counter {} for {}",
                            series.counter_id,
                            metric.entity
                        );
                        None
                    }
                })
                .collect();
            EntityMetric {
                entity: metric.entity,
                values,
            }
        })
        .collect()
}

fn describe(entities: &[ManagedObjectRef]) -> String {
    entities
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn query_perf(
    perf_manager: &ManagedObjectRef,
    entities: &[ManagedObjectRef],
    spec: &PerfQuerySpec,
    counter_ids: &[i32],
) -> String {
    let metric_ids: String = counter_ids
        .iter()
        .map(|id| format!("<metricId><counterId>{id}</counterId><instance></instance></metricId>"))
        .collect();
    let specs: String = entities
        .iter()
        .map(|entity| {
            format!(
                concat!(
                    "<querySpec>{}<maxSample>{}</maxSample>{}",
                    "<intervalId>{}</intervalId><format>{}</format></querySpec>"
                ),
                entity.to_xml("entity"),
                spec.max_sample,
                metric_ids,
                spec.interval_id,
                QUERY_FORMAT,
            )
        })
        .collect();
    format!(
        r#"<QueryPerf xmlns="{}">{}{specs}</QueryPerf>"#,
        soap::VIM_NAMESPACE,
        perf_manager.to_xml("_this"),
    )
}

pub(crate) fn parse_query_perf(text: &str) -> Result<Vec<RawEntityMetric>, SoapError> {
    let doc = soap::parse(text)?;
    let response = soap::response(&doc)?;
    soap::children(response, "returnval")
        .map(|metric| {
            let entity = ManagedObjectRef::from_node(soap::require(metric, "entity")?)?;
            let series = soap::children(metric, "value")
                .map(parse_series)
                .collect::<Result<_, _>>()?;
            Ok(RawEntityMetric { entity, series })
        })
        .collect()
}

fn parse_series(node: Node<'_, '_>) -> Result<RawSeries, SoapError> {
    let id = soap::require(node, "id")?;
    let counter_id = soap::parse_child(id, "counterId")?.ok_or_else(|| soap::missing("counterId"))?;
    let instance = soap::child_text(id, "instance").unwrap_or_default().to_string();
    let values = soap::children(node, "value")
        .map(|v| {
            let text = v.text().map(str::trim).unwrap_or_default();
            text.parse().map_err(|_| SoapError::InvalidValue {
                element: "value".to_string(),
                value: text.to_string(),
            })
        })
        .collect::<Result<_, _>>()?;
    Ok(RawSeries {
        counter_id,
        instance,
        values,
    })
}

/// Parses one `ObjectContent` of the `perfCounter` property.
fn parse_counters(object: Node<'_, '_>) -> Result<Vec<CounterInfo>, SoapError> {
    let mut counters = Vec::new();
    for prop in soap::children(object, "propSet") {
        if soap::child_text(prop, "name") != Some("perfCounter") {
            continue;
        }
        let Some(val) = soap::child(prop, "val") else {
            continue;
        };
        for info in soap::children(val, "PerfCounterInfo") {
            counters.push(parse_counter_info(info)?);
        }
    }
    Ok(counters)
}

fn parse_counter_info(info: Node<'_, '_>) -> Result<CounterInfo, SoapError> {
    let key = soap::parse_child(info, "key")?.ok_or_else(|| soap::missing("key"))?;
    let element_key = |element: &str| -> Result<String, SoapError> {
        let description = soap::require(info, element)?;
        soap::child_text(description, "key")
            .map(str::to_string)
            .ok_or_else(|| soap::missing(&format!("{element}/key")))
    };
    Ok(CounterInfo {
        key,
        group: element_key("groupInfo")?,
        name: element_key("nameInfo")?,
        rollup: soap::child_text(info, "rollupType")
            .ok_or_else(|| soap::missing("rollupType"))?
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fake_sdk::FakeSdk;
    use axum::http::StatusCode;

    const COUNTERS_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body><RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="PerformanceManager">PerfMgr</obj>
<propSet><name>perfCounter</name><val xsi:type="ArrayOfPerfCounterInfo">
<PerfCounterInfo><key>2</key>
<nameInfo><label>Usage</label><summary>CPU usage as a percentage</summary><key>usage</key></nameInfo>
<groupInfo><label>CPU</label><summary>CPU</summary><key>cpu</key></groupInfo>
<unitInfo><label>%</label><summary>Percentage</summary><key>percent</key></unitInfo>
<rollupType>average</rollupType><statsType>rate</statsType><level>1</level></PerfCounterInfo>
<PerfCounterInfo><key>98</key>
<nameInfo><label>Consumed</label><summary>Consumed</summary><key>consumed</key></nameInfo>
<groupInfo><label>Memory</label><summary>Memory</summary><key>mem</key></groupInfo>
<rollupType>average</rollupType></PerfCounterInfo>
</val></propSet>
</objects></returnval></RetrievePropertiesExResponse></soapenv:Body></soapenv:Envelope>"#;

    const QUERY_PERF_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body><QueryPerfResponse xmlns="urn:vim25">
<returnval xsi:type="PerfEntityMetric">
<entity type="VirtualMachine">vm-42</entity>
<sampleInfo><timestamp>2024-01-01T00:00:00Z</timestamp><interval>20</interval></sampleInfo>
<value xsi:type="PerfMetricIntSeries"><id><counterId>2</counterId><instance></instance></id><value>123</value></value>
<value xsi:type="PerfMetricIntSeries"><id><counterId>98</counterId><instance>0</instance></id><value>7</value><value>9</value></value>
<value xsi:type="PerfMetricIntSeries"><id><counterId>555</counterId><instance></instance></id><value>1</value></value>
</returnval>
</QueryPerfResponse></soapenv:Body></soapenv:Envelope>"#;

    fn catalog() -> CounterCatalog {
        let doc = soap::parse(COUNTERS_RESPONSE).unwrap();
        let page = soap::child(soap::response(&doc).unwrap(), "returnval").unwrap();
        let object = soap::child(page, "objects").unwrap();
        CounterCatalog::from_counters(parse_counters(object).unwrap())
    }

    #[test]
    fn test_default_spec_is_latest_realtime_sample() {
        let spec = PerfQuerySpec::default();
        assert_eq!(spec.max_sample, 1);
        assert_eq!(spec.interval_id, 20);
    }

    #[test]
    fn test_parse_counter_catalog() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.id("cpu.usage.average"), Some(2));
        assert_eq!(catalog.name(98), Some("mem.consumed.average"));
        assert_eq!(catalog.id("cpu.ready.summation"), None);
    }

    #[test]
    fn test_resolve_unknown_counter_fails() {
        let catalog = catalog();
        let ids = catalog
            .resolve(&["mem.consumed.average".to_string(), "cpu.usage.average".to_string()])
            .unwrap();
        assert_eq!(ids, vec![98, 2]);

        match catalog.resolve(&["net.usage.average".to_string()]) {
            Err(SampleError::UnknownCounter { name }) => assert_eq!(name, "net.usage.average"),
            other => panic!("expected UnknownCounter, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_query_perf_and_convert() {
        let raw = parse_query_perf(QUERY_PERF_RESPONSE).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].entity.value, "vm-42");
        assert_eq!(raw[0].series.len(), 3);
        assert_eq!(raw[0].series[1].values, vec![7, 9]);

        let metrics = to_metric_series(&catalog(), raw);
        let series = &metrics[0].values;
        // Counter 555 is not in the catalog.
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].name, "cpu.usage.average");
        assert_eq!(series[0].instance, "");
        assert_eq!(series[0].latest(), Some(123));
        assert_eq!(series[1].instance, "0");
        assert_eq!(series[1].latest(), Some(9));
    }

    #[test]
    fn test_series_without_values_are_dropped() {
        let raw = vec![RawEntityMetric {
            entity: ManagedObjectRef::new("VirtualMachine", "vm-1"),
            series: vec![RawSeries {
                counter_id: 2,
                instance: String::new(),
                values: Vec::new(),
            }],
        }];
        let metrics = to_metric_series(&catalog(), raw);
        assert!(metrics[0].values.is_empty());
    }

    #[test]
    fn test_query_perf_request_layout() {
        let body = query_perf(
            &ManagedObjectRef::new("PerformanceManager", "PerfMgr"),
            &[ManagedObjectRef::new("VirtualMachine", "vm-42")],
            &PerfQuerySpec::default(),
            &[2, 98],
        );
        let doc = roxmltree::Document::parse(&body).unwrap();
        let spec = soap::require(doc.root_element(), "querySpec").unwrap();
        let order: Vec<_> = spec
            .children()
            .filter(roxmltree::Node::is_element)
            .map(|n| n.tag_name().name())
            .collect();
        assert_eq!(
            order,
            ["entity", "maxSample", "metricId", "metricId", "intervalId", "format"]
        );
        assert_eq!(soap::child_text(spec, "maxSample"), Some("1"));
        assert_eq!(soap::child_text(spec, "intervalId"), Some("20"));
        assert_eq!(soap::child_text(spec, "format"), Some("normal"));
    }

    #[test]
    fn test_query_perf_fault_is_an_error() {
        let text = r#"<Envelope><Body><Fault><faultcode>ServerFaultCode</faultcode><faultstring>boom</faultstring></Fault></Body></Envelope>"#;
        assert!(matches!(parse_query_perf(text), Err(SoapError::Fault { .. })));
    }

    fn content() -> ServiceContent {
        ServiceContent {
            root_folder: ManagedObjectRef::new("Folder", "group-d1"),
            property_collector: ManagedObjectRef::new("PropertyCollector", "propertyCollector"),
            view_manager: ManagedObjectRef::new("ViewManager", "ViewManager"),
            session_manager: ManagedObjectRef::new("SessionManager", "SessionManager"),
            perf_manager: ManagedObjectRef::new("PerformanceManager", "PerfMgr"),
        }
    }

    #[tokio::test]
    async fn test_load_catalog_and_sample_over_http() {
        let sdk = FakeSdk::start().await;
        sdk.reply_with("RetrievePropertiesEx", StatusCode::OK, COUNTERS_RESPONSE.to_string());
        sdk.reply_with("QueryPerf", StatusCode::OK, QUERY_PERF_RESPONSE.to_string());
        let client = SoapClient::new(sdk.url(), false, Duration::from_secs(5)).unwrap();
        let content = content();

        let catalog = load_catalog(&client, &content).await.unwrap();
        assert_eq!(catalog.len(), 2);

        let entities = [ManagedObjectRef::new("VirtualMachine", "vm-42")];
        let counters = ["cpu.usage.average".to_string()];
        let metrics = sample(
            &client,
            &content,
            &catalog,
            &entities,
            &PerfQuerySpec::default(),
            &counters,
        )
        .await
        .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].values[0].name, "cpu.usage.average");
        assert_eq!(metrics[0].values[0].latest(), Some(123));

        assert_eq!(sdk.operations(), ["RetrievePropertiesEx", "QueryPerf"]);
        assert!(sdk.requests()[1].body.contains("<counterId>2</counterId>"));
    }

    #[tokio::test]
    async fn test_query_failure_names_the_entity() {
        let sdk = FakeSdk::start().await;
        sdk.reply_with(
            "QueryPerf",
            StatusCode::INTERNAL_SERVER_ERROR,
            crate::fake_sdk::fault("ServerFaultCode", "A specified parameter was not correct"),
        );
        let client = SoapClient::new(sdk.url(), false, Duration::from_secs(5)).unwrap();
        let content = content();

        let result = sample(
            &client,
            &content,
            &catalog(),
            &[ManagedObjectRef::new("VirtualMachine", "vm-42")],
            &PerfQuerySpec::default(),
            &["cpu.usage.average".to_string()],
        )
        .await;
        match result {
            Err(SampleError::Query { entity, source }) => {
                assert_eq!(entity, "VirtualMachine:vm-42");
                assert!(matches!(source, SoapError::Fault { .. }));
            }
            other => panic!("expected query error, got {other:?}"),
        }
    }
}
