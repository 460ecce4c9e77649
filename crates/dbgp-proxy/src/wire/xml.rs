//! The handshake/reply XML documents exchanged at the proxy's edges, all in
//! namespace `urn:debugger_protocol_v1`. Only `init` is ever parsed from the
//! wire; the other four are only ever produced by this proxy.

use serde::{Deserialize, Serialize};

use crate::errors::XmlError;

const XML_NS: &str = "urn:debugger_protocol_v1";
const XML_NS_XDEBUG: &str = "https://xdebug.org/dbgp/xdebug";

/// The `init` handshake the engine sends as the first message on a new
/// connection. Only the fields the router needs are modelled; everything
/// else (`engine`, `author`, `url`, `copyright`, ...) is ignored by serde.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "init")]
pub struct Init {
    #[serde(rename = "@idekey", default)]
    pub ide_key: Option<String>,
    /// Cloud client mode sends this prefixed with the `xdebug` namespace, not
    /// bare `userid` — quick-xml's serde layer matches attribute names
    /// literally (it isn't namespace-aware), so the rename must include the
    /// prefix to ever see real `cloudinit`-registered sessions.
    #[serde(rename = "@xdebug:userid", default)]
    pub userid: Option<String>,
}

impl Init {
    pub fn parse(payload: &[u8]) -> Result<Self, XmlError> {
        quick_xml::de::from_reader(payload).map_err(|e| XmlError::Parse(e.to_string()))
    }

    /// The key used to look up a registered IDE: the cloud userid takes
    /// precedence over the plain idekey when both are present.
    pub fn routing_key(&self) -> Result<&str, XmlError> {
        self.userid
            .as_deref()
            .or(self.ide_key.as_deref())
            .ok_or(XmlError::MissingRoutingKey)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyError {
    #[serde(rename = "@id")]
    pub id: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename = "proxyinit")]
pub struct ProxyInit {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@xmlns:xdebug")]
    xmlns_xdebug: &'static str,
    #[serde(rename = "@success")]
    success: u8,
    #[serde(rename = "@idekey")]
    idekey: String,
    #[serde(rename = "@address")]
    address: String,
    #[serde(rename = "@port")]
    port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ReplyError>,
}

impl ProxyInit {
    pub fn success(ide_key: &str, address: &str, port: u16) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 1,
            idekey: ide_key.to_string(),
            address: address.to_string(),
            port: port.to_string(),
            error: None,
        }
    }

    pub fn failure(ide_key: &str, message: String) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 0,
            idekey: ide_key.to_string(),
            address: String::new(),
            port: String::new(),
            error: Some(ReplyError {
                id: "PROXY-ERR-01",
                message,
            }),
        }
    }

    pub fn to_xml(&self) -> Result<String, XmlError> {
        to_xml_document(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename = "proxystop")]
pub struct ProxyStop {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@xmlns:xdebug")]
    xmlns_xdebug: &'static str,
    #[serde(rename = "@success")]
    success: u8,
    #[serde(rename = "@idekey")]
    idekey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ReplyError>,
}

impl ProxyStop {
    pub fn success(ide_key: &str) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 1,
            idekey: ide_key.to_string(),
            error: None,
        }
    }

    pub fn failure(ide_key: &str, message: String) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 0,
            idekey: ide_key.to_string(),
            error: Some(ReplyError {
                id: "PROXY-ERR-02",
                message,
            }),
        }
    }

    pub fn to_xml(&self) -> Result<String, XmlError> {
        to_xml_document(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename = "cloudinit")]
pub struct CloudInit {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@xmlns:xdebug")]
    xmlns_xdebug: &'static str,
    #[serde(rename = "@success")]
    success: u8,
    #[serde(rename = "@userid")]
    userid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ReplyError>,
}

impl CloudInit {
    pub fn success(user_id: &str) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 1,
            userid: user_id.to_string(),
            error: None,
        }
    }

    pub fn failure(user_id: &str, message: String) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 0,
            userid: user_id.to_string(),
            error: Some(ReplyError {
                id: "CLOUD-ERR-11",
                message,
            }),
        }
    }

    pub fn to_xml(&self) -> Result<String, XmlError> {
        to_xml_document(self)
    }

    pub fn is_success(payload: &[u8]) -> bool {
        contains_attribute(payload, "success", "1")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename = "cloudstop")]
pub struct CloudStop {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@xmlns:xdebug")]
    xmlns_xdebug: &'static str,
    #[serde(rename = "@success")]
    success: u8,
    #[serde(rename = "@userid")]
    userid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ReplyError>,
}

impl CloudStop {
    pub fn success(user_id: &str) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 1,
            userid: user_id.to_string(),
            error: None,
        }
    }

    pub fn failure(user_id: &str, message: String) -> Self {
        Self {
            xmlns: XML_NS,
            xmlns_xdebug: XML_NS_XDEBUG,
            success: 0,
            userid: user_id.to_string(),
            error: Some(ReplyError {
                id: "CLOUD-ERR-10",
                message,
            }),
        }
    }

    pub fn to_xml(&self) -> Result<String, XmlError> {
        to_xml_document(self)
    }
}

/// A `detach` response the splice engine synthesises toward the engine
/// side when no matching IDE can be spliced in (absent registration, claim
/// conflict, or a dial failure).
#[derive(Debug, Clone, Serialize)]
#[serde(rename = "response")]
pub struct Detach {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@command")]
    command: &'static str,
    message: String,
}

impl Detach {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            xmlns: XML_NS,
            command: "detach",
            message: reason.into(),
        }
    }

    pub fn to_xml(&self) -> Result<String, XmlError> {
        to_xml_document(self)
    }
}

fn to_xml_document<T: Serialize>(value: &T) -> Result<String, XmlError> {
    let body = quick_xml::se::to_string(value).map_err(|e| XmlError::Serialize(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"iso-8859-1\"?>\n{body}"))
}

/// Terminators that end an in-flight splice when observed in a response
/// flowing from the IDE back toward the engine.
const TERMINATORS: [&str; 2] = ["stop", "detach"];

/// Looks for a `command="..."` attribute anywhere in a response document
/// without requiring the document to match any of the typed shapes above.
/// The splice engine uses this to watch traffic it otherwise forwards
/// uninterpreted, per the "tolerant forwarder" design note.
pub fn terminator(payload: &[u8]) -> Option<&'static str> {
    let value = attribute_value(payload, "command")?;
    TERMINATORS.into_iter().find(|t| *t == value.as_str())
}

fn contains_attribute(payload: &[u8], name: &str, value: &str) -> bool {
    attribute_value(payload, name).as_deref() == Some(value)
}

fn attribute_value(payload: &[u8], name: &str) -> Option<String> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(payload);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == name.as_bytes() {
                        if let Ok(v) = attr.unescape_value() {
                            return Some(v.into_owned());
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_prefers_userid_over_idekey() {
        let doc = br#"<init xmlns:xdebug="https://xdebug.org/dbgp/xdebug" idekey="dr" xdebug:userid="cloudy"/>"#;
        let init = Init::parse(doc).unwrap();
        assert_eq!(init.routing_key().unwrap(), "cloudy");
    }

    #[test]
    fn init_falls_back_to_idekey() {
        let doc = br#"<init idekey="dr"/>"#;
        let init = Init::parse(doc).unwrap();
        assert_eq!(init.routing_key().unwrap(), "dr");
    }

    #[test]
    fn init_without_either_key_errs() {
        let doc = br#"<init language="PHP"/>"#;
        let init = Init::parse(doc).unwrap();
        assert!(matches!(
            init.routing_key(),
            Err(XmlError::MissingRoutingKey)
        ));
    }

    #[test]
    fn proxyinit_success_serialises_expected_shape() {
        let xml = ProxyInit::success("KEY1", "10.0.0.5", 9000).to_xml().unwrap();
        assert!(xml.contains(r#"success="1""#));
        assert!(xml.contains(r#"idekey="KEY1""#));
        assert!(xml.contains(r#"address="10.0.0.5""#));
        assert!(xml.contains(r#"port="9000""#));
    }

    #[test]
    fn proxyinit_failure_carries_error_code() {
        let xml = ProxyInit::failure("KEY1", "already registered".into())
            .to_xml()
            .unwrap();
        assert!(xml.contains(r#"success="0""#));
        assert!(xml.contains("PROXY-ERR-01"));
    }

    #[test]
    fn terminator_detects_stop_and_detach() {
        assert_eq!(
            terminator(br#"<response command="stop"/>"#),
            Some("stop")
        );
        assert_eq!(
            terminator(br#"<response command="detach"/>"#),
            Some("detach")
        );
        assert_eq!(terminator(br#"<response command="step_into"/>"#), None);
    }

    #[test]
    fn detach_serialises_command_and_message() {
        let xml = Detach::new("no such IDE registered").to_xml().unwrap();
        assert!(xml.contains(r#"command="detach""#));
        assert!(xml.contains("no such IDE registered"));
    }

    #[test]
    fn cloudinit_is_success_reads_attribute() {
        let xml = CloudInit::success("u1").to_xml().unwrap();
        assert!(CloudInit::is_success(xml.as_bytes()));
        let xml = CloudInit::failure("u1", "nope".into()).to_xml().unwrap();
        assert!(!CloudInit::is_success(xml.as_bytes()));
    }
}
