//! Sessions against a vSphere endpoint.
//!
//! A [`Connector`] opens a [`Session`] from an [`Endpoint`]; the session is
//! then used for every inventory and performance call of one scrape and is
//! released with [`Session::logout`]. Both are traits so the scrape pipeline
//! can be driven against an in-memory endpoint in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use roxmltree::Node;
use tokio::sync::OnceCell;

use crate::error::{ConnectionError, EnumerationError, SampleError, SoapError};
use crate::inventory::{self, Datacenter, VirtualMachine};
use crate::perf::{self, CounterCatalog, EntityMetric, PerfQuerySpec};
use crate::soap::{self, ManagedObjectRef, SoapClient};

/// Default timeout of a single SOAP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters of a vSphere endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address, optionally with a port.
    pub host: String,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
}

impl Endpoint {
    /// Creates an endpoint with certificate verification enabled.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            insecure: false,
        }
    }

    /// Sets whether TLS certificate verification is skipped.
    #[must_use]
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// The SDK URL of this endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidEndpoint`] if the host is empty or
    /// does not form a valid URL.
    pub fn sdk_url(&self) -> Result<reqwest::Url, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidEndpoint {
            host: self.host.clone(),
            reason,
        };
        if self.host.trim().is_empty() {
            return Err(invalid("host is empty".to_string()));
        }
        reqwest::Url::parse(&format!("https://{}/sdk", self.host.trim()))
            .map_err(|e| invalid(e.to_string()))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Root managed objects of a vim25 endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContent {
    /// Root of the inventory tree.
    pub root_folder: ManagedObjectRef,
    /// The property collector.
    pub property_collector: ManagedObjectRef,
    /// The container view manager.
    pub view_manager: ManagedObjectRef,
    /// The session manager.
    pub session_manager: ManagedObjectRef,
    /// The performance manager.
    pub perf_manager: ManagedObjectRef,
}

impl ServiceContent {
    fn from_node(node: Node<'_, '_>) -> Result<Self, SoapError> {
        let field = |name: &str| ManagedObjectRef::from_node(soap::require(node, name)?);
        Ok(Self {
            root_folder: field("rootFolder")?,
            property_collector: field("propertyCollector")?,
            view_manager: field("viewManager")?,
            session_manager: field("sessionManager")?,
            perf_manager: field("perfManager")?,
        })
    }
}

/// An authenticated session against one endpoint.
#[async_trait]
pub trait Session: Send + Sync {
    /// The endpoint host this session is bound to.
    fn host(&self) -> &str;

    /// Lists every datacenter, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`EnumerationError::Datacenters`] on failure.
    async fn datacenters(&self) -> Result<Vec<Datacenter>, EnumerationError>;

    /// Lists the virtual machine references of one datacenter.
    ///
    /// # Errors
    ///
    /// Returns [`EnumerationError::VirtualMachines`] on failure.
    async fn virtual_machines(
        &self,
        datacenter: &Datacenter,
    ) -> Result<Vec<ManagedObjectRef>, EnumerationError>;

    /// Retrieves the summary, guest and runtime properties of `vms`.
    ///
    /// # Errors
    ///
    /// Returns [`EnumerationError::Properties`] on failure.
    async fn vm_properties(
        &self,
        vms: &[ManagedObjectRef],
    ) -> Result<Vec<VirtualMachine>, EnumerationError>;

    /// Samples `counters` for every entity in `entities`.
    ///
    /// # Errors
    ///
    /// Returns a [`SampleError`] if the catalog cannot be loaded, a counter
    /// is unknown, or the query fails.
    async fn sample(
        &self,
        entities: &[ManagedObjectRef],
        spec: &PerfQuerySpec,
        counters: &[String],
    ) -> Result<Vec<EntityMetric>, SampleError>;

    /// Terminates the session.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the logout call.
    async fn logout(&self) -> Result<(), SoapError>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens an authenticated session against `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the endpoint is unreachable or
    /// rejects the credentials.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, ConnectionError>;
}

/// [`Connector`] speaking vim25 SOAP over HTTPS.
#[derive(Debug, Clone)]
pub struct VsphereConnector {
    request_timeout: Duration,
}

impl VsphereConnector {
    /// Creates a connector with the default request timeout.
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the timeout of each individual SOAP request.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Retrieves the service content from `url`, then logs in.
    async fn open(
        &self,
        url: reqwest::Url,
        endpoint: &Endpoint,
    ) -> Result<VsphereSession, ConnectionError> {
        tracing::debug!("connecting to {url}");
        let client = SoapClient::new(url, endpoint.insecure, self.request_timeout)
            .map_err(ConnectionError::Client)?;

        let content = async {
            let text = client.call(&retrieve_service_content()).await?;
            let doc = soap::parse(&text)?;
            let response = soap::response(&doc)?;
            ServiceContent::from_node(soap::require(response, "returnval")?)
        }
        .await
        .map_err(ConnectionError::ServiceContent)?;

        client
            .call(&login(&content.session_manager, &endpoint.user, &endpoint.password))
            .await
            .map_err(ConnectionError::Login)?;
        tracing::debug!("logged in to {} as {}", endpoint.host, endpoint.user);

        Ok(VsphereSession {
            client,
            content,
            host: endpoint.host.clone(),
            catalog: OnceCell::new(),
        })
    }
}

impl Default for VsphereConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for VsphereConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, ConnectionError> {
        let session = self.open(endpoint.sdk_url()?, endpoint).await?;
        Ok(Box::new(session))
    }
}

/// A logged-in vim25 session.
///
/// The session cookie lives in the client's cookie store. The performance
/// counter catalog is loaded on the first [`Session::sample`] call and
/// reused afterwards.
#[derive(Debug)]
pub struct VsphereSession {
    client: SoapClient,
    content: ServiceContent,
    host: String,
    catalog: OnceCell<CounterCatalog>,
}

impl VsphereSession {
    async fn catalog(&self) -> Result<&CounterCatalog, SampleError> {
        self.catalog
            .get_or_try_init(|| perf::load_catalog(&self.client, &self.content))
            .await
            .map_err(|source| SampleError::CounterCatalog { source })
    }
}

#[async_trait]
impl Session for VsphereSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn datacenters(&self) -> Result<Vec<Datacenter>, EnumerationError> {
        inventory::list_datacenters(&self.client, &self.content)
            .await
            .map_err(|source| EnumerationError::Datacenters { source })
    }

    async fn virtual_machines(
        &self,
        datacenter: &Datacenter,
    ) -> Result<Vec<ManagedObjectRef>, EnumerationError> {
        inventory::list_virtual_machines(&self.client, &self.content, &datacenter.reference)
            .await
            .map_err(|source| EnumerationError::VirtualMachines {
                datacenter: datacenter.name.clone(),
                source,
            })
    }

    async fn vm_properties(
        &self,
        vms: &[ManagedObjectRef],
    ) -> Result<Vec<VirtualMachine>, EnumerationError> {
        inventory::fetch_properties(&self.client, &self.content, vms)
            .await
            .map_err(|source| EnumerationError::Properties { source })
    }

    async fn sample(
        &self,
        entities: &[ManagedObjectRef],
        spec: &PerfQuerySpec,
        counters: &[String],
    ) -> Result<Vec<EntityMetric>, SampleError> {
        let catalog = self.catalog().await?;
        perf::sample(&self.client, &self.content, catalog, entities, spec, counters).await
    }

    async fn logout(&self) -> Result<(), SoapError> {
        self.client.call(&logout(&self.content.session_manager)).await?;
        tracing::debug!("logged out of {}", self.host);
        Ok(())
    }
}

fn retrieve_service_content() -> String {
    format!(
        r#"<RetrieveServiceContent xmlns="{}"><_this type="ServiceInstance">ServiceInstance</_this></RetrieveServiceContent>"#,
        soap::VIM_NAMESPACE
    )
}

fn login(session_manager: &ManagedObjectRef, user: &str, password: &str) -> String {
    format!(
        r#"<Login xmlns="{}">{}<userName>{}</userName><password>{}</password></Login>"#,
        soap::VIM_NAMESPACE,
        session_manager.to_xml("_this"),
        soap::escape(user),
        soap::escape(password),
    )
}

fn logout(session_manager: &ManagedObjectRef) -> String {
    format!(
        r#"<Logout xmlns="{}">{}</Logout>"#,
        soap::VIM_NAMESPACE,
        session_manager.to_xml("_this"),
    )
}
