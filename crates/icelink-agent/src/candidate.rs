//! ICE candidates and their text form.
//!
//! A candidate line looks like
//!
//! ```text
//! candidate:3a8f0c21 1 udp 2130706175 192.168.1.20 50123 typ host
//! candidate:91be77d0 1 udp 1694498559 203.0.113.9 41000 typ srflx raddr 192.168.1.20 rport 50123
//! ```
//!
//! Everything after the port is an ordered list of `key value` extension
//! attributes. The candidate type and related address travel as the
//! `typ`, `raddr` and `rport` attributes and are kept in that list, so
//! serializing a parsed candidate reproduces the input exactly.

use crate::error::{IceError, Result};
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// The only component this agent models
pub const COMPONENT_RTP: u16 = 1;

/// Largest candidate priority (2^31 - 1)
pub const MAX_PRIORITY: u32 = 0x7FFF_FFFF;

const CANDIDATE_PREFIX: &str = "candidate:";
const ATTR_TYPE: &str = "typ";
const ATTR_RELATED_ADDR: &str = "raddr";
const ATTR_RELATED_PORT: &str = "rport";

/// Transport protocol of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// UDP
    Udp,
    /// TCP (parsed and carried, never checked)
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else {
            Err(parse_error(format!("unknown transport protocol '{s}'")))
        }
    }
}

/// (IP, port, transport protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddress {
    /// IP address
    pub ip: IpAddr,
    /// Port
    pub port: u16,
    /// Transport protocol
    pub protocol: TransportProtocol,
}

impl TransportAddress {
    /// UDP transport address
    #[must_use]
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            protocol: TransportProtocol::Udp,
        }
    }

    /// IP and port as a socket address
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.socket_addr(), self.protocol)
    }
}

/// ICE candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Host candidate (local interface address)
    Host,
    /// Server reflexive candidate (public address from STUN)
    ServerReflexive,
    /// Peer reflexive candidate (discovered during connectivity checks)
    PeerReflexive,
    /// Relay candidate (from a TURN server; modeled, never gathered)
    Relay,
}

impl CandidateType {
    /// RFC 8445 Section 5.1.2.2 recommended type preference
    #[must_use]
    pub fn preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::ServerReflexive => write!(f, "srflx"),
            Self::PeerReflexive => write!(f, "prflx"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for CandidateType {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(parse_error(format!("unknown candidate type '{other}'"))),
        }
    }
}

/// Compute candidate priority (RFC 8445 Section 5.1.2)
///
/// Priority = (2^24) * (type preference) + (2^8) * (local preference) + (256 - component ID)
#[must_use]
pub fn candidate_priority(typ: CandidateType, local_pref: u16, component: u16) -> u32 {
    (typ.preference() << 24) + (u32::from(local_pref) << 8) + (256 - u32::from(component.min(256)))
}

/// Foundation shared by candidates of one type from one base IP (and, for
/// reflexive candidates, one STUN server).
fn compute_foundation(typ: CandidateType, base_ip: IpAddr, server: Option<SocketAddr>) -> String {
    let mut hasher = DefaultHasher::new();
    typ.hash(&mut hasher);
    base_ip.hash(&mut hasher);
    server.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

fn parse_error(msg: String) -> IceError {
    IceError::Parse(Cow::Owned(msg))
}

/// One local or remote network path endpoint.
///
/// Immutable once created; accessors only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    foundation: String,
    component: u16,
    address: TransportAddress,
    priority: u32,
    candidate_type: CandidateType,
    related_address: Option<TransportAddress>,
    attributes: Vec<(String, String)>,
}

impl Candidate {
    /// Host candidate for a socket bound to `address`
    #[must_use]
    pub fn host(address: SocketAddr, local_pref: u16) -> Self {
        let typ = CandidateType::Host;
        Self {
            foundation: compute_foundation(typ, address.ip(), None),
            component: COMPONENT_RTP,
            address: TransportAddress::udp(address),
            priority: candidate_priority(typ, local_pref, COMPONENT_RTP),
            candidate_type: typ,
            related_address: None,
            attributes: vec![(ATTR_TYPE.to_string(), typ.to_string())],
        }
    }

    /// Server reflexive candidate learned from `server` through `base`
    #[must_use]
    pub fn server_reflexive(
        address: SocketAddr,
        base: SocketAddr,
        server: SocketAddr,
        local_pref: u16,
    ) -> Self {
        let typ = CandidateType::ServerReflexive;
        Self {
            foundation: compute_foundation(typ, base.ip(), Some(server)),
            component: COMPONENT_RTP,
            address: TransportAddress::udp(address),
            priority: candidate_priority(typ, local_pref, COMPONENT_RTP),
            candidate_type: typ,
            related_address: Some(TransportAddress::udp(base)),
            attributes: vec![
                (ATTR_TYPE.to_string(), typ.to_string()),
                (ATTR_RELATED_ADDR.to_string(), base.ip().to_string()),
                (ATTR_RELATED_PORT.to_string(), base.port().to_string()),
            ],
        }
    }

    /// Peer reflexive remote candidate learned from an inbound check.
    ///
    /// `priority` comes from the request's PRIORITY attribute and is capped
    /// at [`MAX_PRIORITY`].
    #[must_use]
    pub fn peer_reflexive(address: SocketAddr, priority: u32) -> Self {
        let typ = CandidateType::PeerReflexive;
        Self {
            foundation: compute_foundation(typ, address.ip(), Some(address)),
            component: COMPONENT_RTP,
            address: TransportAddress::udp(address),
            priority: priority.min(MAX_PRIORITY),
            candidate_type: typ,
            related_address: None,
            attributes: vec![(ATTR_TYPE.to_string(), typ.to_string())],
        }
    }

    /// Copy of this candidate with one more extension attribute.
    ///
    /// # Errors
    ///
    /// `Parse` if key or value is empty or contains whitespace, or the key is
    /// one of `typ`, `raddr`, `rport`.
    pub fn with_attribute(mut self, key: &str, value: &str) -> Result<Self> {
        let bad = |s: &str| s.is_empty() || s.chars().any(char::is_whitespace);
        if bad(key) || bad(value) {
            return Err(IceError::parse("attribute key and value must be non-empty tokens"));
        }
        if matches!(key, ATTR_TYPE | ATTR_RELATED_ADDR | ATTR_RELATED_PORT) {
            return Err(parse_error(format!("attribute '{key}' is reserved")));
        }
        self.attributes.push((key.to_string(), value.to_string()));
        Ok(self)
    }

    /// Foundation
    #[must_use]
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// Component ID
    #[must_use]
    pub fn component(&self) -> u16 {
        self.component
    }

    /// Transport address
    #[must_use]
    pub fn address(&self) -> TransportAddress {
        self.address
    }

    /// IP and port
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.address.socket_addr()
    }

    /// Transport protocol
    #[must_use]
    pub fn protocol(&self) -> TransportProtocol {
        self.address.protocol
    }

    /// Priority
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Candidate type
    #[must_use]
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    /// Related address (reflexive and relayed candidates)
    #[must_use]
    pub fn related_address(&self) -> Option<TransportAddress> {
        self.related_address
    }

    /// Extension attributes in insertion order, `typ`/`raddr`/`rport` included
    #[must_use]
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Local preference bits of the priority
    #[must_use]
    pub fn local_preference(&self) -> u16 {
        ((self.priority >> 8) & 0xFFFF) as u16
    }

    /// Address of the socket a local candidate sends from.
    ///
    /// Reflexive candidates are sent from their base, which is the related
    /// address; every other candidate is its own base.
    #[must_use]
    pub fn base_address(&self) -> SocketAddr {
        match (self.candidate_type, self.related_address) {
            (CandidateType::ServerReflexive | CandidateType::Relay, Some(related)) => {
                related.socket_addr()
            }
            _ => self.socket_addr(),
        }
    }

    /// Priority a peer reflexive candidate derived from this local candidate
    /// would get. Sent in the PRIORITY attribute of checks.
    #[must_use]
    pub fn peer_reflexive_priority(&self) -> u32 {
        candidate_priority(
            CandidateType::PeerReflexive,
            self.local_preference(),
            self.component,
        )
    }

    /// Whether the two candidates can form a pair
    #[must_use]
    pub fn is_compatible(&self, other: &Candidate) -> bool {
        self.component == other.component
            && self.address.protocol == other.address.protocol
            && self.address.ip.is_ipv4() == other.address.ip.is_ipv4()
    }

    /// Candidate line (same as `to_string()`)
    #[must_use]
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Parse a candidate line.
    ///
    /// # Errors
    ///
    /// `Parse` on any malformed field; nothing is returned partially.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let rest = line
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| IceError::parse("missing 'candidate:' prefix"))?;

        let tokens: Vec<&str> = rest.split(' ').collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(IceError::parse("empty field in candidate line"));
        }
        if tokens.len() < 6 {
            return Err(IceError::parse("candidate line has fewer than 6 fields"));
        }
        if (tokens.len() - 6) % 2 != 0 {
            return Err(IceError::parse("extension attribute without a value"));
        }

        let foundation = tokens[0];
        if foundation.len() > 32
            || !foundation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
        {
            return Err(parse_error(format!("invalid foundation '{foundation}'")));
        }

        let component: u16 = tokens[1]
            .parse()
            .map_err(|_| parse_error(format!("invalid component '{}'", tokens[1])))?;
        if component == 0 || component > 256 {
            return Err(parse_error(format!("component {component} out of range")));
        }
        let protocol: TransportProtocol = tokens[2].parse()?;
        let priority: u32 = tokens[3]
            .parse()
            .map_err(|_| parse_error(format!("invalid priority '{}'", tokens[3])))?;
        if priority > MAX_PRIORITY {
            return Err(parse_error(format!("priority {priority} out of range")));
        }
        let ip: IpAddr = tokens[4]
            .parse()
            .map_err(|_| parse_error(format!("invalid address '{}'", tokens[4])))?;
        let port: u16 = tokens[5]
            .parse()
            .map_err(|_| parse_error(format!("invalid port '{}'", tokens[5])))?;

        let mut candidate_type = None;
        let mut related_ip: Option<IpAddr> = None;
        let mut related_port: Option<u16> = None;
        let mut attributes = Vec::with_capacity((tokens.len() - 6) / 2);

        for kv in tokens[6..].chunks_exact(2) {
            let (key, value) = (kv[0], kv[1]);
            match key {
                ATTR_TYPE => {
                    if candidate_type.replace(value.parse::<CandidateType>()?).is_some() {
                        return Err(IceError::parse("duplicate 'typ' attribute"));
                    }
                }
                ATTR_RELATED_ADDR => {
                    let ip = value
                        .parse()
                        .map_err(|_| parse_error(format!("invalid raddr '{value}'")))?;
                    if related_ip.replace(ip).is_some() {
                        return Err(IceError::parse("duplicate 'raddr' attribute"));
                    }
                }
                ATTR_RELATED_PORT => {
                    let port = value
                        .parse()
                        .map_err(|_| parse_error(format!("invalid rport '{value}'")))?;
                    if related_port.replace(port).is_some() {
                        return Err(IceError::parse("duplicate 'rport' attribute"));
                    }
                }
                _ => {}
            }
            attributes.push((key.to_string(), value.to_string()));
        }

        let candidate_type =
            candidate_type.ok_or_else(|| IceError::parse("missing 'typ' attribute"))?;
        let related_address = match (related_ip, related_port) {
            (Some(ip), Some(port)) => Some(TransportAddress { ip, port, protocol }),
            (None, None) => None,
            _ => return Err(IceError::parse("'raddr' and 'rport' must appear together")),
        };

        Ok(Self {
            foundation: foundation.to_string(),
            component,
            address: TransportAddress { ip, port, protocol },
            priority,
            candidate_type,
            related_address,
            attributes,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {} {} {} {} {}",
            CANDIDATE_PREFIX,
            self.foundation,
            self.component,
            self.address.protocol,
            self.priority,
            self.address.ip,
            self.address.port
        )?;
        for (key, value) in &self.attributes {
            write!(f, " {key} {value}")?;
        }
        Ok(())
    }
}

impl FromStr for Candidate {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
