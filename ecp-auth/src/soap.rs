//! PAOS/SOAP envelope handling for the ECP profile
//!
//! The exchange only needs a handful of edits: drop the SP's SOAP header,
//! lift the `ecp:RelayState` out of it, and splice that element into the
//! IdP's header before the response goes back to the SP. Everything else
//! (in particular the signed SAML payload in the body) is forwarded
//! byte-for-byte, so the envelopes are edited by source offsets rather
//! than re-serialized.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{EcpError, Result};

/// SOAP 1.1 envelope namespace
pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// SAML2 ECP profile namespace
pub const ECP_NS: &str = "urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp";

/// Liberty PAOS namespace
pub const PAOS_NS: &str = "urn:liberty:paos:2003-08";

/// Body of the fault sent to the SP when the IdP names a different ACS
pub const ACS_MISMATCH_FAULT: &str = concat!(
    r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/">"#,
    "<S:Body><S:Fault><faultcode>S:Server</faultcode>",
    "<faultstring>responseConsumerURL from SP and assertionConsumerServiceURL ",
    "from IdP do not match</faultstring>",
    "</S:Fault></S:Body></S:Envelope>",
);

type Binding = (Option<String>, String);

#[derive(Debug)]
struct Node {
    namespace: Option<String>,
    local: String,
    qname: String,
    depth: usize,
    start: usize,
    content_start: usize,
    content_end: usize,
    end: usize,
    attributes: Vec<(String, String)>,
    declared: Vec<Binding>,
    inherited: Vec<Binding>,
}

impl Node {
    fn is(&self, namespace: &str, local: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local == local
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn contains(&self, other: &Node) -> bool {
        other.start > self.start && other.end <= self.end
    }
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn lookup(scopes: &[Vec<Binding>], prefix: Option<&str>) -> Option<String> {
    scopes
        .iter()
        .rev()
        .flat_map(|scope| scope.iter().rev())
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, uri)| uri.clone())
}

fn in_scope(scopes: &[Vec<Binding>]) -> Vec<Binding> {
    let mut bindings: Vec<Binding> = Vec::new();
    for (prefix, uri) in scopes.iter().flatten() {
        bindings.retain(|(p, _)| p != prefix);
        bindings.push((prefix.clone(), uri.clone()));
    }
    bindings
}

fn tag_start(xml: &str, from: usize) -> usize {
    xml[from..].find('<').map_or(from, |offset| from + offset)
}

fn open_node(
    xml: &str,
    e: &BytesStart<'_>,
    before: usize,
    after: usize,
    depth: usize,
    scopes: &[Vec<Binding>],
) -> Result<Node> {
    let qname = std::str::from_utf8(e.name().as_ref())
        .map_err(|e| EcpError::Xml(e.to_string()))?
        .to_string();

    let mut attributes = Vec::new();
    let mut declared = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| EcpError::Xml(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| EcpError::Xml(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| EcpError::Xml(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            declared.push((None, value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.push((Some(prefix.to_string()), value));
        } else {
            attributes.push((key, value));
        }
    }

    let (prefix, local) = split_qname(&qname);
    let namespace = declared
        .iter()
        .rev()
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, uri)| uri.clone())
        .or_else(|| lookup(scopes, prefix));
    if prefix.is_some() && namespace.is_none() {
        return Err(EcpError::Xml(format!("unbound namespace prefix in <{}>", qname)));
    }

    Ok(Node {
        namespace,
        local: local.to_string(),
        qname: qname.clone(),
        depth,
        start: tag_start(xml, before),
        content_start: after,
        content_end: after,
        end: after,
        attributes,
        declared,
        inherited: in_scope(scopes),
    })
}

/// Parse `xml` into a flat, document-ordered element list with byte spans
fn scan(xml: &str) -> Result<Vec<Node>> {
    let mut reader = Reader::from_str(xml);
    let mut nodes: Vec<Node> = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut scopes: Vec<Vec<Binding>> = Vec::new();

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event()?;
        let after = reader.buffer_position() as usize;
        match event {
            Event::Start(e) => {
                if open.is_empty() && !nodes.is_empty() {
                    return Err(EcpError::Xml("multiple root elements".to_string()));
                }
                let node = open_node(xml, &e, before, after, open.len(), &scopes)?;
                scopes.push(node.declared.clone());
                open.push(nodes.len());
                nodes.push(node);
            }
            Event::Empty(e) => {
                if open.is_empty() && !nodes.is_empty() {
                    return Err(EcpError::Xml("multiple root elements".to_string()));
                }
                let node = open_node(xml, &e, before, after, open.len(), &scopes)?;
                nodes.push(node);
            }
            Event::End(_) => {
                let idx = open
                    .pop()
                    .ok_or_else(|| EcpError::Xml("unexpected closing tag".to_string()))?;
                scopes.pop();
                nodes[idx].content_end = tag_start(xml, before);
                nodes[idx].end = after;
            }
            Event::Text(text) => {
                if open.is_empty() && !text.iter().all(u8::is_ascii_whitespace) {
                    return Err(EcpError::Xml("text outside of the root element".to_string()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !open.is_empty() {
        return Err(EcpError::Xml("unexpected end of document".to_string()));
    }
    if nodes.is_empty() {
        return Err(EcpError::Xml("document has no root element".to_string()));
    }
    Ok(nodes)
}

fn child<'n>(nodes: &'n [Node], parent: &Node, namespace: &str, local: &str) -> Option<&'n Node> {
    nodes
        .iter()
        .find(|n| n.depth == parent.depth + 1 && parent.contains(n) && n.is(namespace, local))
}

fn envelope_header(nodes: &[Node]) -> Result<&Node> {
    let root = &nodes[0];
    if !root.is(SOAP_ENV_NS, "Envelope") {
        return Err(EcpError::MissingElement {
            element: "S:Envelope".to_string(),
        });
    }
    child(nodes, root, SOAP_ENV_NS, "Header").ok_or_else(|| EcpError::MissingElement {
        element: "S:Envelope/S:Header".to_string(),
    })
}

/// Copy an element out of its document, redeclaring every namespace it
/// inherited so it stays valid wherever it is pasted
fn detach(xml: &str, node: &Node) -> String {
    let mut declarations = String::new();
    for (prefix, uri) in &node.inherited {
        if node.declared.iter().any(|(p, _)| p == prefix) {
            continue;
        }
        let uri = quick_xml::escape::escape(uri.as_str());
        match prefix {
            Some(prefix) => declarations.push_str(&format!(" xmlns:{}=\"{}\"", prefix, uri)),
            None => declarations.push_str(&format!(" xmlns=\"{}\"", uri)),
        }
    }
    let raw = &xml[node.start..node.end];
    let split = 1 + node.qname.len();
    format!("{}{}{}", &raw[..split], declarations, &raw[split..])
}

/// The SP's PAOS request, taken apart for forwarding to the IdP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpRequest {
    /// Where the SP expects the IdP's response to be delivered
    pub response_consumer_url: String,
    /// The `ecp:RelayState` element, self-contained
    pub relay_state: String,
    /// The envelope with its SOAP header removed
    pub idp_request: String,
}

/// Extract the PAOS request fields and build the IdP-bound envelope
pub fn parse_sp_request(xml: &str) -> Result<SpRequest> {
    let nodes = scan(xml)?;
    let header = envelope_header(&nodes)?;

    let request =
        child(&nodes, header, PAOS_NS, "Request").ok_or_else(|| EcpError::MissingElement {
            element: "S:Header/paos:Request".to_string(),
        })?;
    let response_consumer_url = request
        .attribute("responseConsumerURL")
        .ok_or_else(|| EcpError::MissingElement {
            element: "paos:Request/@responseConsumerURL".to_string(),
        })?
        .to_string();

    let relay =
        child(&nodes, header, ECP_NS, "RelayState").ok_or_else(|| EcpError::MissingElement {
            element: "S:Header/ecp:RelayState".to_string(),
        })?;

    let idp_request = format!("{}{}", &xml[..header.start], &xml[header.end..]);

    Ok(SpRequest {
        response_consumer_url,
        relay_state: detach(xml, relay),
        idp_request,
    })
}

/// The IdP's authentication response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdpResponse {
    /// Where the IdP says the assertion must be delivered
    pub assertion_consumer_service_url: String,
    xml: String,
    first_header_child: (usize, usize),
}

impl IdpResponse {
    /// The envelope to post back to the SP: the first header entry (the
    /// `ecp:Response`) is replaced by the SP's relay state
    pub fn with_relay_state(&self, relay_state: &str) -> String {
        let (start, end) = self.first_header_child;
        format!("{}{}{}", &self.xml[..start], relay_state, &self.xml[end..])
    }
}

/// Parse the IdP's SOAP response
pub fn parse_idp_response(xml: &str) -> Result<IdpResponse> {
    let nodes = scan(xml)?;
    let header = envelope_header(&nodes)?;

    let response =
        child(&nodes, header, ECP_NS, "Response").ok_or_else(|| EcpError::MissingElement {
            element: "S:Header/ecp:Response".to_string(),
        })?;
    let assertion_consumer_service_url = response
        .attribute("AssertionConsumerServiceURL")
        .ok_or_else(|| EcpError::MissingElement {
            element: "ecp:Response/@AssertionConsumerServiceURL".to_string(),
        })?
        .to_string();

    let first = nodes
        .iter()
        .find(|n| n.depth == header.depth + 1 && header.contains(n))
        .unwrap_or(response);

    Ok(IdpResponse {
        assertion_consumer_service_url,
        xml: xml.to_string(),
        first_header_child: (first.start, first.end),
    })
}
