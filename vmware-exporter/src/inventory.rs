//! Inventory enumeration: datacenters, their virtual machines, and the
//! summary / guest / runtime property groups of each VM.
//!
//! # Design
//!
//! Listing uses a recursive `ContainerView` rooted at the inventory root (for
//! datacenters) or at a datacenter (for VMs), read through the property
//! collector and destroyed afterwards. Properties for every VM of a
//! datacenter are fetched in a single `RetrievePropertiesEx` call, paging
//! with `ContinueRetrievePropertiesEx` when the collector hands back a token.
//!
//! The records produced here are plain data; they are read by the scrape
//! tasks and never mutated.

use roxmltree::Node;

use crate::error::SoapError;
use crate::session::ServiceContent;
use crate::soap::{self, ManagedObjectRef, SoapClient};

/// Property groups fetched for every virtual machine.
pub const VM_PROPERTIES: [&str; 3] = ["summary", "guest", "runtime"];

/// An inventory root owning zero or more virtual machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datacenter {
    /// Server reference, e.g. `Datacenter:datacenter-2`.
    pub reference: ManagedObjectRef,
    /// Display name.
    pub name: String,
}

/// Snapshot of one virtual machine's eagerly fetched properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VirtualMachine {
    /// Server reference, e.g. `VirtualMachine:vm-42`.
    pub reference: ManagedObjectRef,
    /// The `summary` property group.
    pub summary: VmSummary,
    /// The `guest` property group.
    pub guest: GuestInfo,
    /// The `runtime` property group.
    pub runtime: RuntimeInfo,
}

/// Fields read from `VirtualMachineSummary`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmSummary {
    /// VM display name (`config.name`).
    pub name: String,
    /// vCenter-assigned instance UUID (`config.instanceUuid`).
    pub instance_uuid: Option<String>,
    /// Configured memory in MB (`config.memorySizeMB`).
    pub memory_size_mb: i64,
    /// Configured virtual CPU count (`config.numCpu`).
    pub num_cpu: i64,
    /// Live usage figures.
    pub quick_stats: QuickStats,
}

/// Fields read from `VirtualMachineQuickStats`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuickStats {
    /// CPU usage in MHz.
    pub overall_cpu_usage: i64,
    /// Guest memory actively used, in MB.
    pub guest_memory_usage: i64,
}

/// Fields read from `GuestInfo`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GuestInfo {
    /// Guest filesystems reported by VMware Tools.
    pub disks: Vec<GuestDisk>,
}

/// One entry of `GuestInfo.disk`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GuestDisk {
    /// Mount point or drive path as reported by the guest.
    pub disk_path: String,
    /// Total capacity in bytes.
    pub capacity: i64,
    /// Free space in bytes.
    pub free_space: i64,
}

/// Fields read from `VirtualMachineRuntimeInfo`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeInfo {
    /// Power state, e.g. `poweredOn`.
    pub power_state: Option<String>,
    /// Upper bound of CPU usage in MHz.
    pub max_cpu_usage: i64,
    /// Upper bound of memory usage in MB.
    pub max_memory_usage: i64,
}

/// Label carrier derived from a virtual machine.
///
/// The primary label is the instance UUID; the secondary label is empty for
/// whole-VM series and set per disk for disk-scoped series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    uuid: String,
}

impl Instance {
    /// Derives the instance of `vm`, or `None` if the VM has no resolvable
    /// instance UUID.
    pub fn from_vm(vm: &VirtualMachine) -> Option<Self> {
        let uuid = vm.summary.instance_uuid.as_deref()?.trim();
        if uuid.is_empty() {
            return None;
        }
        Some(Self {
            uuid: uuid.to_string(),
        })
    }

    /// The instance UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Label values for a series of this instance, `extra` being the
    /// secondary label.
    pub fn label_values(&self, extra: &str) -> Vec<String> {
        vec![self.uuid.clone(), extra.to_string()]
    }
}

/// Strips backslashes from a guest disk path (`C:\` becomes `C:`).
pub fn sanitize_disk_path(path: &str) -> String {
    path.replace('\\', "")
}

/// Lists every datacenter under the inventory root, sorted by name.
///
/// # Errors
///
/// Returns the transport or parse error of any of the underlying calls.
pub async fn list_datacenters(
    client: &SoapClient,
    content: &ServiceContent,
) -> Result<Vec<Datacenter>, SoapError> {
    let mut datacenters = with_container_view(
        client,
        content,
        &content.root_folder,
        "Datacenter",
        &["name"],
        parse_datacenter,
    )
    .await?;
    datacenters.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(datacenters)
}

/// Lists the references of every virtual machine under `datacenter`.
///
/// # Errors
///
/// Returns the transport or parse error of any of the underlying calls.
pub async fn list_virtual_machines(
    client: &SoapClient,
    content: &ServiceContent,
    datacenter: &ManagedObjectRef,
) -> Result<Vec<ManagedObjectRef>, SoapError> {
    with_container_view(
        client,
        content,
        datacenter,
        "VirtualMachine",
        &[],
        parse_object_ref,
    )
    .await
}

/// Retrieves the [`VM_PROPERTIES`] groups of every VM in `vms` in one batch.
///
/// # Errors
///
/// Returns the transport or parse error of the property collector call.
pub async fn fetch_properties(
    client: &SoapClient,
    content: &ServiceContent,
    vms: &[ManagedObjectRef],
) -> Result<Vec<VirtualMachine>, SoapError> {
    if vms.is_empty() {
        return Ok(Vec::new());
    }
    let objects: String = vms
        .iter()
        .map(|vm| format!("<objectSet>{}<skip>false</skip></objectSet>", vm.to_xml("obj")))
        .collect();
    let spec = spec_set("VirtualMachine", &VM_PROPERTIES, &objects);
    retrieve(client, &content.property_collector, &spec, parse_virtual_machine).await
}

/// Creates a container view of `kind` under `container`, reads `paths` of
/// every member, then destroys the view.
async fn with_container_view<T: Send>(
    client: &SoapClient,
    content: &ServiceContent,
    container: &ManagedObjectRef,
    kind: &str,
    paths: &[&str],
    parse: fn(Node<'_, '_>) -> Result<T, SoapError>,
) -> Result<Vec<T>, SoapError> {
    let text = client
        .call(&create_container_view(&content.view_manager, container, kind))
        .await?;
    let view = {
        let doc = soap::parse(&text)?;
        let response = soap::response(&doc)?;
        ManagedObjectRef::from_node(soap::require(response, "returnval")?)?
    };

    let spec = spec_set(kind, paths, &view_object_set(&view));
    let result = retrieve(client, &content.property_collector, &spec, parse).await;

    if let Err(e) = client.call(&destroy_view(&view)).await {
        tracing::debug!("failed to destroy container view {view}: {e}");
    }
    result
}

/// Runs `RetrievePropertiesEx` and follows continuation tokens until the
/// result set is exhausted.
pub(crate) async fn retrieve<T: Send>(
    client: &SoapClient,
    collector: &ManagedObjectRef,
    spec: &str,
    parse: fn(Node<'_, '_>) -> Result<T, SoapError>,
) -> Result<Vec<T>, SoapError> {
    let mut out = Vec::new();
    let mut text = client.call(&retrieve_properties_ex(collector, spec)).await?;
    loop {
        let token = {
            let doc = soap::parse(&text)?;
            let response = soap::response(&doc)?;
            let Some(page) = soap::child(response, "returnval") else {
                break;
            };
            for object in soap::children(page, "objects") {
                out.push(parse(object)?);
            }
            soap::child_text(page, "token").map(str::to_string)
        };
        match token {
            Some(token) => {
                text = client
                    .call(&continue_retrieve_properties_ex(collector, &token))
                    .await?;
            }
            None => break,
        }
    }
    Ok(out)
}

pub(crate) fn create_container_view(
    view_manager: &ManagedObjectRef,
    container: &ManagedObjectRef,
    kind: &str,
) -> String {
    format!(
        r#"<CreateContainerView xmlns="{ns}">{this}{container}<type>{kind}</type><recursive>true</recursive></CreateContainerView>"#,
        ns = soap::VIM_NAMESPACE,
        this = view_manager.to_xml("_this"),
        container = container.to_xml("container"),
        kind = soap::escape(kind),
    )
}

pub(crate) fn destroy_view(view: &ManagedObjectRef) -> String {
    format!(
        r#"<DestroyView xmlns="{}">{}</DestroyView>"#,
        soap::VIM_NAMESPACE,
        view.to_xml("_this")
    )
}

/// A `PropertyFilterSpec` selecting `paths` of objects of `kind` reached
/// through `object_sets`.
pub(crate) fn spec_set(kind: &str, paths: &[&str], object_sets: &str) -> String {
    let path_set: String = paths
        .iter()
        .map(|p| format!("<pathSet>{}</pathSet>", soap::escape(p)))
        .collect();
    format!(
        concat!(
            "<specSet><propSet><type>{}</type><all>false</all>{}</propSet>",
            "{}</specSet>"
        ),
        soap::escape(kind),
        path_set,
        object_sets,
    )
}

fn view_object_set(view: &ManagedObjectRef) -> String {
    format!(
        concat!(
            "<objectSet>{}<skip>true</skip>",
            r#"<selectSet xsi:type="TraversalSpec"><name>traverseView</name>"#,
            "<type>ContainerView</type><path>view</path><skip>false</skip></selectSet>",
            "</objectSet>"
        ),
        view.to_xml("obj")
    )
}

pub(crate) fn retrieve_properties_ex(collector: &ManagedObjectRef, spec: &str) -> String {
    format!(
        r#"<RetrievePropertiesEx xmlns="{}">{}{spec}<options/></RetrievePropertiesEx>"#,
        soap::VIM_NAMESPACE,
        collector.to_xml("_this"),
    )
}

fn continue_retrieve_properties_ex(collector: &ManagedObjectRef, token: &str) -> String {
    format!(
        r#"<ContinueRetrievePropertiesEx xmlns="{}">{}<token>{}</token></ContinueRetrievePropertiesEx>"#,
        soap::VIM_NAMESPACE,
        collector.to_xml("_this"),
        soap::escape(token),
    )
}

/// Iterates `(name, val)` pairs of an `ObjectContent`'s `propSet`.
fn properties<'a, 'input: 'a>(
    object: Node<'a, 'input>,
) -> impl Iterator<Item = (&'a str, Node<'a, 'input>)> + 'a {
    soap::children(object, "propSet").filter_map(|prop| {
        let name = soap::child_text(prop, "name")?;
        let val = soap::child(prop, "val")?;
        Some((name, val))
    })
}

fn parse_object_ref(object: Node<'_, '_>) -> Result<ManagedObjectRef, SoapError> {
    ManagedObjectRef::from_node(soap::require(object, "obj")?)
}

fn parse_datacenter(object: Node<'_, '_>) -> Result<Datacenter, SoapError> {
    let reference = parse_object_ref(object)?;
    let name = properties(object)
        .find(|(name, _)| *name == "name")
        .and_then(|(_, val)| val.text())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| reference.value.clone());
    Ok(Datacenter { reference, name })
}

fn parse_virtual_machine(object: Node<'_, '_>) -> Result<VirtualMachine, SoapError> {
    let mut vm = VirtualMachine {
        reference: parse_object_ref(object)?,
        ..VirtualMachine::default()
    };
    for (name, val) in properties(object) {
        match name {
            "summary" => vm.summary = parse_summary(val)?,
            "guest" => vm.guest = parse_guest(val)?,
            "runtime" => vm.runtime = parse_runtime(val)?,
            _ => {}
        }
    }
    Ok(vm)
}

fn parse_summary(val: Node<'_, '_>) -> Result<VmSummary, SoapError> {
    let mut summary = VmSummary::default();
    if let Some(config) = soap::child(val, "config") {
        summary.name = soap::child_text(config, "name").unwrap_or_default().to_string();
        summary.instance_uuid = soap::child_text(config, "instanceUuid").map(str::to_string);
        summary.memory_size_mb = soap::parse_child(config, "memorySizeMB")?.unwrap_or(0);
        summary.num_cpu = soap::parse_child(config, "numCpu")?.unwrap_or(0);
    }
    if let Some(stats) = soap::child(val, "quickStats") {
        summary.quick_stats = QuickStats {
            overall_cpu_usage: soap::parse_child(stats, "overallCpuUsage")?.unwrap_or(0),
            guest_memory_usage: soap::parse_child(stats, "guestMemoryUsage")?.unwrap_or(0),
        };
    }
    Ok(summary)
}

fn parse_guest(val: Node<'_, '_>) -> Result<GuestInfo, SoapError> {
    let disks = soap::children(val, "disk")
        .map(|disk| {
            Ok(GuestDisk {
                disk_path: soap::child_text(disk, "diskPath").unwrap_or_default().to_string(),
                capacity: soap::parse_child(disk, "capacity")?.unwrap_or(0),
                free_space: soap::parse_child(disk, "freeSpace")?.unwrap_or(0),
            })
        })
        .collect::<Result<_, SoapError>>()?;
    Ok(GuestInfo { disks })
}

fn parse_runtime(val: Node<'_, '_>) -> Result<RuntimeInfo, SoapError> {
    Ok(RuntimeInfo {
        power_state: soap::child_text(val, "powerState").map(str::to_string),
        max_cpu_usage: soap::parse_child(val, "maxCpuUsage")?.unwrap_or(0),
        max_memory_usage: soap::parse_child(val, "maxMemoryUsage")?.unwrap_or(0),
    })
}
