//! Service port specifications.
//!
//! A [`PortSpec`] names a port a service listens on: the number, the
//! transport protocol, and an optional application protocol tag ("http",
//! "postgres", ...).
//!
//! Two string forms exist:
//!
//! - The **declaration form** users write in plans and requests:
//!   `[app-proto:]number[/transport]`, e.g. `"http:3333"` or `"3333/udp"`.
//! - The **label form** written onto backend objects so containers can be
//!   re-associated with their ports across runtime restarts:
//!   `<port-id>:<number>/<transport>[/<app-proto>]`, comma-joined across the
//!   whole port map. This form must round-trip exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// TCP (the default when a declaration omits the transport).
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl TransportProtocol {
    fn parse(token: &str, spec: &str) -> Result<Self> {
        match token {
            "tcp" => Ok(TransportProtocol::Tcp),
            "udp" => Ok(TransportProtocol::Udp),
            "sctp" => Ok(TransportProtocol::Sctp),
            other => Err(Error::InvalidPortSpec {
                spec: spec.to_string(),
                reason: format!("unrecognized transport protocol '{other}'"),
            }),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
            TransportProtocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// A single port specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port number in `1..=65535`.
    pub number: u16,
    /// Transport protocol.
    pub transport: TransportProtocol,
    /// Optional application protocol tag (e.g. "http").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maybe_application_protocol: Option<String>,
}

impl PortSpec {
    /// Creates a TCP port spec with no application protocol.
    pub fn tcp(number: u16) -> Result<Self> {
        Self::new(number, TransportProtocol::Tcp, None)
    }

    /// Creates a port spec, rejecting port number zero.
    pub fn new(
        number: u16,
        transport: TransportProtocol,
        maybe_application_protocol: Option<String>,
    ) -> Result<Self> {
        if number == 0 {
            return Err(Error::InvalidPortSpec {
                spec: number.to_string(),
                reason: "port number must be in range 1..=65535".to_string(),
            });
        }
        Ok(Self {
            number,
            transport,
            maybe_application_protocol,
        })
    }

    /// Parses the declaration form: `[app-proto:]number[/transport]`.
    ///
    /// Examples: `"http:3333"` → (3333, tcp, "http"); `"3333/udp"` →
    /// (3333, udp, none). Failures name the token that was bad.
    pub fn parse(spec: &str) -> Result<Self> {
        let (maybe_app, rest) = match spec.split_once(':') {
            Some((app, rest)) => {
                if app.is_empty() {
                    return Err(Error::InvalidPortSpec {
                        spec: spec.to_string(),
                        reason: "application protocol before ':' is empty".to_string(),
                    });
                }
                (Some(app.to_string()), rest)
            }
            None => (None, spec),
        };

        let (number_token, maybe_transport_token) = match rest.split_once('/') {
            Some((num, transport)) => (num, Some(transport)),
            None => (rest, None),
        };

        let number: u16 = number_token.parse().map_err(|_| Error::InvalidPortSpec {
            spec: spec.to_string(),
            reason: format!("port number '{number_token}' is not a valid integer"),
        })?;

        let transport = match maybe_transport_token {
            Some(token) => TransportProtocol::parse(token, spec)?,
            None => TransportProtocol::Tcp,
        };

        Self::new(number, transport, maybe_app)
    }

    /// Renders the label form for one port: `<id>:<num>/<transport>[/<app>]`.
    fn to_label_fragment(&self, port_id: &str) -> String {
        match &self.maybe_application_protocol {
            Some(app) => format!("{port_id}:{}/{}/{app}", self.number, self.transport),
            None => format!("{port_id}:{}/{}", self.number, self.transport),
        }
    }

    /// Parses one label-form fragment back into `(port-id, spec)`.
    fn from_label_fragment(fragment: &str) -> Result<(String, Self)> {
        let (port_id, rest) = fragment.split_once(':').ok_or_else(|| Error::InvalidPortSpec {
            spec: fragment.to_string(),
            reason: "missing ':' between port id and number".to_string(),
        })?;
        if port_id.is_empty() {
            return Err(Error::InvalidPortSpec {
                spec: fragment.to_string(),
                reason: "port id before ':' is empty".to_string(),
            });
        }

        let mut pieces = rest.split('/');
        let number_token = pieces.next().unwrap_or_default();
        let number: u16 = number_token.parse().map_err(|_| Error::InvalidPortSpec {
            spec: fragment.to_string(),
            reason: format!("port number '{number_token}' is not a valid integer"),
        })?;

        let transport_token = pieces.next().ok_or_else(|| Error::InvalidPortSpec {
            spec: fragment.to_string(),
            reason: "missing transport protocol after port number".to_string(),
        })?;
        let transport = TransportProtocol::parse(transport_token, fragment)?;

        let maybe_app = pieces.next().map(str::to_string);
        if pieces.next().is_some() {
            return Err(Error::InvalidPortSpec {
                spec: fragment.to_string(),
                reason: "too many '/'-separated tokens".to_string(),
            });
        }

        Ok((port_id.to_string(), Self::new(number, transport, maybe_app)?))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.maybe_application_protocol {
            Some(app) => write!(f, "{app}:{}/{}", self.number, self.transport),
            None => write!(f, "{}/{}", self.number, self.transport),
        }
    }
}

// =============================================================================
// Port Map Serialization (label form)
// =============================================================================

/// Serializes a port map to the label form, comma-joined.
///
/// Keys are emitted in sorted order so the label value is deterministic.
pub fn serialize_port_map(ports: &BTreeMap<String, PortSpec>) -> String {
    ports
        .iter()
        .map(|(id, spec)| spec.to_label_fragment(id))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma-joined label value back into a port map.
///
/// The empty string parses to an empty map. Any malformed fragment fails the
/// whole parse with a typed error naming the bad token.
pub fn deserialize_port_map(label_value: &str) -> Result<BTreeMap<String, PortSpec>> {
    let mut ports = BTreeMap::new();
    if label_value.is_empty() {
        return Ok(ports);
    }
    for fragment in label_value.split(',') {
        let (port_id, spec) = PortSpec::from_label_fragment(fragment)?;
        if ports.insert(port_id.clone(), spec).is_some() {
            return Err(Error::InvalidPortSpec {
                spec: label_value.to_string(),
                reason: format!("duplicate port id '{port_id}'"),
            });
        }
    }
    Ok(ports)
}
