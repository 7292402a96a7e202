//! Basic types shared by the resolver core.
//!
//! This module collects the small value types the rest of the crate is
//! built from: server addresses, record types and response codes, questions
//! and responses as the codec produces them, and the typed resource
//! records the lookups return.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// The well-known DNS port.
pub const DNS_PORT: u16 = 53;

/// The longest acceptable lookup name in presentation format.
const MAX_NAME_LEN: usize = 255;

/// The longest acceptable label within a lookup name.
const MAX_LABEL_LEN: usize = 63;

//------------ ServerAddress -------------------------------------------------

/// The address of an upstream resolver.
///
/// This is an IP address plus a UDP port which defaults to 53. Two values
/// compare equal if both parts are equal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ServerAddress {
    /// The IP address of the server.
    addr: IpAddr,

    /// The UDP port to send queries to.
    port: u16,
}

impl ServerAddress {
    /// Creates a new server address with an explicit port.
    pub fn with_port(addr: IpAddr, port: u16) -> Self {
        ServerAddress { addr, port }
    }

    /// Creates a new server address using the DNS port.
    pub fn new(addr: IpAddr) -> Self {
        Self::with_port(addr, DNS_PORT)
    }

    /// Returns the IP address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the address as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<IpAddr> for ServerAddress {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr)
    }
}

impl From<Ipv4Addr> for ServerAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self::new(addr.into())
    }
}

impl From<Ipv6Addr> for ServerAddress {
    fn from(addr: Ipv6Addr) -> Self {
        Self::new(addr.into())
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::with_port(addr.ip(), addr.port())
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    /// Parses a bare IP address, dotted IPv4 or colon IPv6, into a server
    /// address on the DNS port. This is the format OS resolver
    /// configurations hand out nameservers in.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpAddr::from_str(s.trim())
            .map(Self::new)
            .map_err(|_| Error::InvalidName)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

//------------ Rtype ---------------------------------------------------------

/// A DNS resource record type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Rtype(pub u16);

impl Rtype {
    /// A host address.
    pub const A: Rtype = Rtype(1);

    /// An authoritative name server.
    pub const NS: Rtype = Rtype(2);

    /// The canonical name for an alias.
    pub const CNAME: Rtype = Rtype(5);

    /// A domain name pointer.
    pub const PTR: Rtype = Rtype(12);

    /// Mail exchange.
    pub const MX: Rtype = Rtype(15);

    /// Text strings.
    pub const TXT: Rtype = Rtype(16);

    /// An IPv6 host address.
    pub const AAAA: Rtype = Rtype(28);

    /// Server selection.
    pub const SRV: Rtype = Rtype(33);
}

impl fmt::Display for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Rtype::A => f.write_str("A"),
            Rtype::NS => f.write_str("NS"),
            Rtype::CNAME => f.write_str("CNAME"),
            Rtype::PTR => f.write_str("PTR"),
            Rtype::MX => f.write_str("MX"),
            Rtype::TXT => f.write_str("TXT"),
            Rtype::AAAA => f.write_str("AAAA"),
            Rtype::SRV => f.write_str("SRV"),
            Rtype(value) => write!(f, "TYPE{}", value),
        }
    }
}

//------------ Rcode ---------------------------------------------------------

/// A DNS response code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Rcode(pub u8);

impl Rcode {
    /// No error condition.
    pub const NOERROR: Rcode = Rcode(0);

    /// The server was unable to interpret the query.
    pub const FORMERR: Rcode = Rcode(1);

    /// The server failed to process the query.
    pub const SERVFAIL: Rcode = Rcode(2);

    /// The queried name does not exist.
    pub const NXDOMAIN: Rcode = Rcode(3);

    /// The server does not support the kind of query.
    pub const NOTIMP: Rcode = Rcode(4);

    /// The server refused to process the query.
    pub const REFUSED: Rcode = Rcode(5);
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Rcode::NOERROR => f.write_str("NOERROR"),
            Rcode::FORMERR => f.write_str("FORMERR"),
            Rcode::SERVFAIL => f.write_str("SERVFAIL"),
            Rcode::NXDOMAIN => f.write_str("NXDOMAIN"),
            Rcode::NOTIMP => f.write_str("NOTIMP"),
            Rcode::REFUSED => f.write_str("REFUSED"),
            Rcode(value) => write!(f, "RCODE{}", value),
        }
    }
}

//------------ Question ------------------------------------------------------

/// A single question to be sent to a server.
///
/// The name is expected to have passed through [`normalize_name`] already.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    /// The message ID the query is sent under.
    pub id: u16,

    /// The domain name asked about.
    pub name: String,

    /// The record type asked about.
    pub rtype: Rtype,
}

//------------ Response ------------------------------------------------------

/// A decoded response as handed over by the codec.
///
/// Only the answer section is represented. Authority and additional
/// records, if the codec parses them at all, are not the core's business.
#[derive(Clone, Debug)]
pub struct Response {
    /// The message ID copied from the query.
    pub id: u16,

    /// The response code.
    pub rcode: Rcode,

    /// Whether the response was truncated.
    pub truncated: bool,

    /// The records of the answer section.
    pub answers: Vec<Record>,
}

//------------ Record --------------------------------------------------------

/// A single resource record from a response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// The owner name of the record.
    pub name: String,

    /// The record type.
    pub rtype: Rtype,

    /// The remaining time to live in seconds.
    pub ttl: u32,

    /// The typed record data.
    pub data: RecordData,
}

//------------ RecordData ----------------------------------------------------

/// The data of a resource record, typed by record type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordData {
    /// An IPv4 host address.
    A(Ipv4Addr),

    /// An IPv6 host address.
    Aaaa(Ipv6Addr),

    /// A mail exchange.
    Mx(Mx),

    /// A server selection record.
    Srv(Srv),

    /// A sequence of text strings.
    Txt(Vec<String>),

    /// The canonical name for an alias.
    Cname(String),

    /// An authoritative name server.
    Ns(String),

    /// A domain name pointer.
    Ptr(String),
}

//------------ Mx ------------------------------------------------------------

/// The data of a mail exchange record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mx {
    /// The preference of this exchange, lower is better.
    pub preference: u16,

    /// The name of the mail exchange host.
    pub exchange: String,
}

//------------ Srv -----------------------------------------------------------

/// The data of a server selection record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Srv {
    /// The priority of the target host, lower is better.
    pub priority: u16,

    /// A relative weight for entries of the same priority.
    pub weight: u16,

    /// The port on the target host.
    pub port: u16,

    /// The domain name of the target host.
    pub target: String,
}

//------------ Name handling -------------------------------------------------

/// Normalizes a lookup name into lowercase ASCII.
///
/// An optional trailing dot is removed. Fails with [`Error::InvalidName`]
/// if the name is empty, too long, contains empty or over-long labels, or
/// contains non-ASCII or control characters.
pub fn normalize_name(name: &str) -> Result<String, Error> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName);
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidName);
        }
        if !label
            .bytes()
            .all(|ch| ch.is_ascii_graphic())
        {
            return Err(Error::InvalidName);
        }
    }
    Ok(name.to_ascii_lowercase())
}

//============ Testing =======================================================
