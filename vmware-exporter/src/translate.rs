//! Mapping of raw performance counter keys to output metric names.
//!
//! Counter keys have the form `group.counter.rollup`. Known keys map through
//! a static table; any other key maps to itself with every `.` replaced by
//! `_`, so counters the table does not know still produce a valid name.

/// Static counter table, in the order counters are sampled by default.
const COUNTER_TABLE: [(&str, &str); 10] = [
    ("cpu.usage.average", "vm_cpu_usage_average"),
    ("cpu.idle.summation", "vm_cpu_idle_summation"),
    ("mem.usage.average", "vm_mem_usage_average"),
    ("mem.active.average", "vm_mem_active_average"),
    ("mem.consumed.average", "vm_mem_consumed_average"),
    ("net.usage.average", "vm_net_usage_average"),
    ("net.transmitted.average", "vm_net_transmitted_average"),
    ("net.received.average", "vm_net_received_average"),
    ("disk.write.average", "vm_disk_write_average"),
    ("disk.read.average", "vm_disk_read_average"),
];

/// Counter keys sampled for every VM unless extended by configuration.
pub const DEFAULT_COUNTERS: [&str; 10] = [
    COUNTER_TABLE[0].0,
    COUNTER_TABLE[1].0,
    COUNTER_TABLE[2].0,
    COUNTER_TABLE[3].0,
    COUNTER_TABLE[4].0,
    COUNTER_TABLE[5].0,
    COUNTER_TABLE[6].0,
    COUNTER_TABLE[7].0,
    COUNTER_TABLE[8].0,
    COUNTER_TABLE[9].0,
];

/// Returns the static table entry for `raw`, if there is one.
pub fn lookup(raw: &str) -> Option<&'static str> {
    COUNTER_TABLE
        .iter()
        .find(|(key, _)| *key == raw)
        .map(|(_, name)| *name)
}

/// Translates a raw counter key into an output metric name.
///
/// ```
/// use vmware_exporter::translate::translate;
///
/// assert_eq!(translate("cpu.usage.average"), "vm_cpu_usage_average");
/// assert_eq!(translate("cpu.ready.summation"), "cpu_ready_summation");
/// ```
pub fn translate(raw: &str) -> String {
    match lookup(raw) {
        Some(name) => name.to_string(),
        None => raw.replace('.', "_"),
    }
}

/// The default counter list followed by `extra`, without duplicates.
pub fn counter_list(extra: &[String]) -> Vec<String> {
    let mut counters: Vec<String> = DEFAULT_COUNTERS.iter().map(|c| (*c).to_string()).collect();
    for counter in extra {
        let counter = counter.trim();
        if !counter.is_empty() && !counters.iter().any(|c| c == counter) {
            counters.push(counter.to_string());
        }
    }
    counters
}
