//! vim25 SOAP transport.
//!
//! The vSphere management API speaks SOAP 1.1 over HTTPS. This module owns the
//! HTTP client, wraps request bodies in an envelope, turns SOAP faults into
//! [`SoapError::Fault`], and provides small DOM helpers used by the
//! [`inventory`](crate::inventory) and [`perf`](crate::perf) parsers.
//!
//! Request bodies are produced with `format!` against the vim25 schema; every
//! interpolated string goes through [`escape`]. Responses are parsed with
//! `roxmltree` and matched by local element name, so namespace prefixes chosen
//! by the server do not matter.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use roxmltree::{Document, Node};

use crate::error::SoapError;

/// XML namespace of the vim25 API.
pub const VIM_NAMESPACE: &str = "urn:vim25";

/// Value of the `SOAPAction` header. 6.5 is understood by every supported
/// vCenter and ESXi release.
const SOAP_ACTION: &str = "urn:vim25/6.5";

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// A typed reference to a server-side managed object (`vm-42`, `group-d1`...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ManagedObjectRef {
    /// The managed object type, e.g. `VirtualMachine`.
    pub kind: String,
    /// The server-assigned identifier, e.g. `vm-42`.
    pub value: String,
}

impl ManagedObjectRef {
    /// Creates a new reference.
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Renders the reference as a vim25 element named `tag`.
    pub fn to_xml(&self, tag: &str) -> String {
        format!(
            r#"<{tag} type="{}">{}</{tag}>"#,
            escape(&self.kind),
            escape(&self.value)
        )
    }

    /// Reads a reference from an element carrying a `type` attribute.
    ///
    /// # Errors
    ///
    /// Returns [`SoapError::MissingElement`] if the element has no `type`
    /// attribute or no text.
    pub fn from_node(node: Node<'_, '_>) -> Result<Self, SoapError> {
        let kind = node
            .attribute("type")
            .ok_or_else(|| missing(&format!("{}@type", node.tag_name().name())))?;
        let value = node
            .text()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| missing(node.tag_name().name()))?;
        Ok(Self::new(kind, value))
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// HTTP transport bound to one `/sdk` URL.
///
/// Carries its own cookie store, so the `vmware_soap_session` cookie set by
/// `Login` authenticates every later call made through the same client.
#[derive(Debug, Clone)]
pub struct SoapClient {
    http: reqwest::Client,
    url: reqwest::Url,
}

impl SoapClient {
    /// Builds a client for `url`.
    ///
    /// `insecure` disables certificate verification. `timeout` bounds every
    /// individual request.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the TLS backend cannot be initialised.
    pub fn new(
        url: reqwest::Url,
        insecure: bool,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(insecure)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, url })
    }

    /// Posts `body` wrapped in a SOAP envelope and returns the raw response
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`SoapError::Fault`] for SOAP faults, [`SoapError::Status`] for
    /// other non-2xx responses and [`SoapError::Http`] for transport failures.
    pub async fn call(&self, body: &str) -> Result<String, SoapError> {
        let response = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope(body))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        match fault(&text) {
            Some(err) => Err(err),
            None => Err(SoapError::Status {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}

/// Wraps a vim25 request body in a SOAP 1.1 envelope.
pub fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="{xsi}">"#,
            "<soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"
        ),
        xsi = XSI_NAMESPACE,
        body = body,
    )
}

/// Escapes text for inclusion in element content or attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Parses a response document.
///
/// # Errors
///
/// Returns [`SoapError::Xml`] if the text is not well-formed.
pub fn parse(text: &str) -> Result<Document<'_>, SoapError> {
    Ok(Document::parse(text)?)
}

/// Returns the single element inside `Envelope/Body`, i.e. the
/// `<FooResponse>` of a call.
///
/// # Errors
///
/// Returns [`SoapError::Fault`] if the body holds a fault, or
/// [`SoapError::MissingElement`] if it is empty.
pub fn response<'a, 'input>(doc: &'a Document<'input>) -> Result<Node<'a, 'input>, SoapError> {
    let body = child(doc.root_element(), "Body").ok_or_else(|| missing("Body"))?;
    let inner = body
        .children()
        .find(Node::is_element)
        .ok_or_else(|| missing("Body/*"))?;
    if inner.tag_name().name() == "Fault" {
        return Err(fault_from(inner));
    }
    Ok(inner)
}

/// Decodes a SOAP fault from a raw response, if the text holds one.
fn fault(text: &str) -> Option<SoapError> {
    let doc = Document::parse(text).ok()?;
    let body = child(doc.root_element(), "Body")?;
    let node = child(body, "Fault")?;
    Some(fault_from(node))
}

fn fault_from(node: Node<'_, '_>) -> SoapError {
    SoapError::Fault {
        code: child_text(node, "faultcode").unwrap_or_default().to_string(),
        message: child_text(node, "faultstring").unwrap_or_default().to_string(),
    }
}

/// First direct child element with local name `name`.
pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// All direct child elements with local name `name`.
pub fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Trimmed text of the first direct child named `name`.
pub fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text()).map(str::trim)
}

/// Like [`child`], but a missing element is an error.
///
/// # Errors
///
/// Returns [`SoapError::MissingElement`] naming the element.
pub fn require<'a, 'input>(
    node: Node<'a, 'input>,
    name: &str,
) -> Result<Node<'a, 'input>, SoapError> {
    child(node, name).ok_or_else(|| missing(name))
}

/// Parses the text of child `name`, if present.
///
/// # Errors
///
/// Returns [`SoapError::InvalidValue`] if the text does not parse as `T`.
pub fn parse_child<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<Option<T>, SoapError> {
    match child_text(node, name) {
        None => Ok(None),
        Some(text) => text.parse().map(Some).map_err(|_| SoapError::InvalidValue {
            element: name.to_string(),
            value: text.to_string(),
        }),
    }
}

pub(crate) fn missing(element: &str) -> SoapError {
    SoapError::MissingElement {
        element: element.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAULT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
<soapenv:Body>
<soapenv:Fault>
<faultcode>ServerFaultCode</faultcode>
<faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>
</soapenv:Fault>
</soapenv:Body>
</soapenv:Envelope>"#;

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_envelope_is_well_formed() {
        let text = envelope(concat!(
            r#"<Logout xmlns="urn:vim25">"#,
            r#"<_this type="SessionManager">SessionManager</_this></Logout>"#
        ));
        let doc = parse(&text).unwrap();
        let inner = response(&doc).unwrap();
        assert_eq!(inner.tag_name().name(), "Logout");
        assert_eq!(inner.tag_name().namespace(), Some(VIM_NAMESPACE));
    }

    #[test]
    fn test_response_decodes_fault() {
        let doc = parse(FAULT).unwrap();
        match response(&doc) {
            Err(SoapError::Fault { code, message }) => {
                assert_eq!(code, "ServerFaultCode");
                assert!(message.contains("incorrect user name"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_fault_from_raw_text() {
        assert!(matches!(fault(FAULT), Some(SoapError::Fault { .. })));
        assert!(fault("<html>502 Bad Gateway</html>").is_none());
        assert!(fault("not xml").is_none());
    }

    #[test]
    fn test_moref_roundtrip_through_xml() {
        let moref = ManagedObjectRef::new("VirtualMachine", "vm-42");
        let xml = moref.to_xml("obj");
        assert_eq!(xml, r#"<obj type="VirtualMachine">vm-42</obj>"#);

        let doc = Document::parse(&xml).unwrap();
        let parsed = ManagedObjectRef::from_node(doc.root_element()).unwrap();
        assert_eq!(parsed, moref);
        assert_eq!(parsed.to_string(), "VirtualMachine:vm-42");
    }

    #[test]
    fn test_moref_without_type_is_rejected() {
        let doc = Document::parse("<obj>vm-1</obj>").unwrap();
        assert!(ManagedObjectRef::from_node(doc.root_element()).is_err());
    }

    #[test]
    fn test_parse_child() {
        let doc = Document::parse("<a><n>42</n><bad>x</bad></a>").unwrap();
        let root = doc.root_element();
        assert_eq!(parse_child::<i64>(root, "n").unwrap(), Some(42));
        assert_eq!(parse_child::<i64>(root, "absent").unwrap(), None);
        assert!(matches!(
            parse_child::<i64>(root, "bad"),
            Err(SoapError::InvalidValue { .. })
        ));
    }
}
