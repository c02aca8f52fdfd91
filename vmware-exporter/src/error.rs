//! Error types for the vmware-exporter scrape pipeline.
//!
//! The taxonomy mirrors the blast radius of each failure: a
//! [`ConnectionError`] ends the whole scrape, an [`EnumerationError`] ends the
//! scrape or a single datacenter depending on where it happened, and a
//! [`SampleError`] only drops one VM's performance metrics.

use thiserror::Error;

/// The main error type for all exporter operations.
#[derive(Error, Debug)]
pub enum ExporterError {
    /// Error talking SOAP to the endpoint.
    #[error("soap error: {0}")]
    Soap(#[from] SoapError),

    /// Error opening a session.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Error walking the inventory.
    #[error("enumeration error: {0}")]
    Enumeration(#[from] EnumerationError),

    /// Error sampling performance counters.
    #[error("sample error: {0}")]
    Sample(#[from] SampleError),

    /// Error writing to or encoding the metric registry.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Errors raised by the vim25 SOAP transport.
#[derive(Error, Debug)]
pub enum SoapError {
    /// The HTTP request could not be sent or the body could not be read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status that was not a SOAP fault.
    #[error("endpoint returned status {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The endpoint answered with a SOAP fault.
    #[error("SOAP fault {code}: {message}")]
    Fault {
        /// The `faultcode` element.
        code: String,
        /// The `faultstring` element.
        message: String,
    },

    /// The response body was not well-formed XML.
    #[error("malformed XML response: {0}")]
    Xml(#[from] roxmltree::Error),

    /// A required element was missing from the response.
    #[error("response is missing element <{element}>")]
    MissingElement {
        /// Local name of the missing element.
        element: String,
    },

    /// An element was present but its text could not be interpreted.
    #[error("element <{element}> has invalid value {value:?}")]
    InvalidValue {
        /// Local name of the offending element.
        element: String,
        /// The raw text content.
        value: String,
    },
}

/// Errors that can occur when opening a session.
///
/// Any of these aborts the scrape before a session exists, so there is
/// nothing to log out.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The configured host does not form a valid endpoint URL.
    #[error("invalid endpoint '{host}': {reason}")]
    InvalidEndpoint {
        /// The configured host.
        host: String,
        /// Why the URL could not be built.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Fetching the service content failed (DNS, TLS, transport).
    #[error("failed to retrieve service content: {0}")]
    ServiceContent(#[source] SoapError),

    /// The endpoint rejected the credentials.
    #[error("login failed: {0}")]
    Login(#[source] SoapError),
}

/// Errors that can occur while walking the inventory.
#[derive(Error, Debug)]
pub enum EnumerationError {
    /// Listing datacenters failed. Fatal to the scrape.
    #[error("failed to list datacenters: {source}")]
    Datacenters {
        /// The underlying transport error.
        #[source]
        source: SoapError,
    },

    /// Listing the virtual machines of one datacenter failed.
    #[error("failed to list virtual machines of datacenter '{datacenter}': {source}")]
    VirtualMachines {
        /// Name of the datacenter being listed.
        datacenter: String,
        /// The underlying transport error.
        #[source]
        source: SoapError,
    },

    /// The batched property fetch for a set of virtual machines failed.
    #[error("failed to retrieve virtual machine properties: {source}")]
    Properties {
        /// The underlying transport error.
        #[source]
        source: SoapError,
    },
}

/// Errors that can occur while sampling performance counters.
#[derive(Error, Debug)]
pub enum SampleError {
    /// The performance counter catalog could not be loaded.
    #[error("failed to load performance counter catalog: {source}")]
    CounterCatalog {
        /// The underlying transport error.
        #[source]
        source: SoapError,
    },

    /// A requested counter name does not exist on the endpoint.
    #[error("counter {name:?} not found")]
    UnknownCounter {
        /// The raw `group.counter.rollup` key.
        name: String,
    },

    /// The `QueryPerf` call failed.
    #[error("performance query for {entity} failed: {source}")]
    Query {
        /// The queried entity reference.
        entity: String,
        /// The underlying transport error.
        #[source]
        source: SoapError,
    },
}

/// Errors that can occur in the metric sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The prometheus registry rejected a family or label set.
    #[error("registry error: {0}")]
    Registry(#[from] prometheus::Error),

    /// A sample's label names differ from the family's declared schema.
    #[error("metric {name} declared labels {expected:?}, sample carries {actual:?}")]
    SchemaMismatch {
        /// The fully-qualified family name.
        name: String,
        /// Label names the family was created with.
        expected: Vec<String>,
        /// Label names carried by the rejected sample.
        actual: Vec<String>,
    },

    /// Text exposition encoding failed.
    #[error("failed to encode metrics: {reason}")]
    Encode {
        /// Description of the failure.
        reason: String,
    },
}

/// Type alias for `Result<T, ExporterError>`.
pub type Result<T> = std::result::Result<T, ExporterError>;
