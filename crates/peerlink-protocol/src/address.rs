//! Endpoint addresses and their native `sockaddr` encoding.
//!
//! The uTP engine takes and hands back socket addresses as raw
//! `struct sockaddr_in` / `struct sockaddr_in6` blobs. [`EndpointAddress`]
//! is the Rust-side value type; [`EndpointAddress::encode`] and
//! [`EndpointAddress::decode`] convert to and from the exact bytes the
//! engine reads and writes.
//!
//! ```text
//! sockaddr_in  (16 bytes)  family:2 | port:2 (BE) | addr:4  | zero:8
//! sockaddr_in6 (28 bytes)  family:2 | port:2 (BE) | flow:4  | addr:16 | scope:4
//! ```
//!
//! The family field is a native-endian `u16` on Linux and Windows. BSD-derived
//! systems split it into a length byte followed by a one-byte family.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Size of `struct sockaddr_in`.
pub const SOCKADDR_IN_LEN: usize = 16;
/// Size of `struct sockaddr_in6`.
pub const SOCKADDR_IN6_LEN: usize = 28;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const HAS_SA_LEN: bool = true;
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
const HAS_SA_LEN: bool = false;

/// `AF_INET` is 2 everywhere we build.
pub const AF_INET: u16 = 2;

/// `AF_INET6` for the target platform.
#[cfg(windows)]
pub const AF_INET6: u16 = 23;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const AF_INET6: u16 = 30;
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
pub const AF_INET6: u16 = 28;
#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
pub const AF_INET6: u16 = 24;
#[cfg(not(any(
    windows,
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
pub const AF_INET6: u16 = 10;

// ---------------------------------------------------------------------------
// AddressFamily
// ---------------------------------------------------------------------------

/// IP version of an [`EndpointAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Length of the native sockaddr structure for this family.
    pub fn sockaddr_len(self) -> usize {
        match self {
            Self::V4 => SOCKADDR_IN_LEN,
            Self::V6 => SOCKADDR_IN6_LEN,
        }
    }

    /// Platform `AF_*` constant for this family.
    pub fn raw(self) -> u16 {
        match self {
            Self::V4 => AF_INET,
            Self::V6 => AF_INET6,
        }
    }
}

// ---------------------------------------------------------------------------
// EndpointAddress
// ---------------------------------------------------------------------------

/// An immutable host/port pair with a cached native `sockaddr` encoding.
///
/// Hosts are normalized when the address is built: IPv4 as a dotted quad,
/// IPv6 as eight lowercase hex groups without leading zeros (`fe80:0:0:0:0:0:0:1`).
/// Decoding always produces that same form, so an address in canonical form
/// survives `decode(encode(a))` unchanged.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointAddress {
    ip: IpAddr,
    host: String,
    port: u16,
    encoded: OnceLock<Box<[u8]>>,
}

impl EndpointAddress {
    /// Parses a textual host and pairs it with `port`.
    ///
    /// The family is IPv6 when the host contains a `:`. Standard notations
    /// (including `::` abbreviation and `[..]` brackets) are accepted. Anything
    /// else goes through a lenient group-by-group parse where missing groups
    /// count as zero, so `"10.1"` is `10.1.0.0`.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidAddress`] if there are too many groups or a
    /// group is not a number in range.
    pub fn parse(host: &str, port: u16) -> Result<Self, ProtocolError> {
        let trimmed = host.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(trimmed);

        let ip = if unbracketed.contains(':') {
            IpAddr::V6(parse_v6(unbracketed)?)
        } else {
            IpAddr::V4(parse_v4(unbracketed)?)
        };
        Ok(Self::new(ip, port))
    }

    /// Builds an address from an already-parsed IP.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            host: canonical_host(&ip),
            ip,
            port,
            encoded: OnceLock::new(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        match self.ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// The normalized textual host.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The native `sockaddr` bytes for this address.
    ///
    /// Computed on first use and cached; the slice is exactly
    /// [`AddressFamily::sockaddr_len`] bytes long.
    pub fn encode(&self) -> &[u8] {
        self.encoded.get_or_init(|| encode_ip(self.ip, self.port))
    }

    /// Reads an address out of a native `sockaddr` buffer.
    ///
    /// Only the family field and the family-specific region are inspected;
    /// trailing bytes beyond 16 (IPv4) or 28 (IPv6) are ignored.
    ///
    /// # Errors
    /// [`ProtocolError::Truncated`] if the buffer is too short for its family,
    /// [`ProtocolError::UnknownFamily`] for anything but `AF_INET`/`AF_INET6`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 2 {
            return Err(ProtocolError::Truncated {
                expected: 2,
                actual: bytes.len(),
            });
        }
        let family = read_family(bytes);
        let family = match family {
            AF_INET => AddressFamily::V4,
            AF_INET6 => AddressFamily::V6,
            other => return Err(ProtocolError::UnknownFamily(other)),
        };

        let needed = family.sockaddr_len();
        if bytes.len() < needed {
            return Err(ProtocolError::Truncated {
                expected: needed,
                actual: bytes.len(),
            });
        }

        let port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let ip = match family {
            AddressFamily::V4 => {
                IpAddr::V4(Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]))
            }
            AddressFamily::V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[8..24]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        Ok(Self::new(ip, port))
    }
}

impl PartialEq for EndpointAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for EndpointAddress {}

impl std::hash::Hash for EndpointAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointAddress")
            .field("family", &self.family())
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family() {
            AddressFamily::V4 => write!(f, "{}:{}", self.host, self.port),
            AddressFamily::V6 => write!(f, "[{}]:{}", self.host, self.port),
        }
    }
}

impl From<SocketAddr> for EndpointAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<&EndpointAddress> for SocketAddr {
    fn from(addr: &EndpointAddress) -> Self {
        addr.socket_addr()
    }
}

/// Parses `host:port`, `[v6]:port`, or `v6-host` style strings.
impl FromStr for EndpointAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ProtocolError::invalid(s, "unterminated '['"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| ProtocolError::invalid(s, "missing port"))?;
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| ProtocolError::invalid(s, "missing port"))?;
            if host.contains(':') {
                return Err(ProtocolError::invalid(
                    s,
                    "IPv6 hosts must be bracketed when a port is given",
                ));
            }
            (host, port)
        };
        let port: u16 = port
            .parse()
            .map_err(|_| ProtocolError::invalid(s, format!("bad port {port:?}")))?;
        Self::parse(host, port)
    }
}

// ---------------------------------------------------------------------------
// Serde helper
// ---------------------------------------------------------------------------

// Serialized as the `Display` form ("1.2.3.4:5", "[0:0:0:0:0:0:0:1]:5").

impl TryFrom<String> for EndpointAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointAddress> for String {
    fn from(value: EndpointAddress) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Parsing and encoding helpers
// ---------------------------------------------------------------------------

fn parse_v4(host: &str) -> Result<Ipv4Addr, ProtocolError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let groups: Vec<&str> = host.split('.').collect();
    if groups.len() > 4 {
        return Err(ProtocolError::invalid(
            host,
            format!("expected at most 4 groups, got {}", groups.len()),
        ));
    }
    let mut octets = [0u8; 4];
    for (slot, group) in octets.iter_mut().zip(&groups) {
        if group.is_empty() {
            continue;
        }
        *slot = group.parse().map_err(|_| {
            ProtocolError::invalid(host, format!("group {group:?} is not an octet"))
        })?;
    }
    Ok(Ipv4Addr::from(octets))
}

fn parse_v6(host: &str) -> Result<Ipv6Addr, ProtocolError> {
    // Zone ids ("fe80::1%eth0") have no place in the sockaddr we emit.
    let host = host.split_once('%').map_or(host, |(addr, _zone)| addr);
    if let Ok(ip) = host.parse::<Ipv6Addr>() {
        return Ok(ip);
    }
    let groups: Vec<&str> = host.split(':').collect();
    if groups.len() > 8 {
        return Err(ProtocolError::invalid(
            host,
            format!("expected at most 8 groups, got {}", groups.len()),
        ));
    }
    let mut segments = [0u16; 8];
    for (slot, group) in segments.iter_mut().zip(&groups) {
        if group.is_empty() {
            continue;
        }
        *slot = u16::from_str_radix(group, 16).map_err(|_| {
            ProtocolError::invalid(host, format!("group {group:?} is not a 16-bit hex value"))
        })?;
    }
    Ok(Ipv6Addr::from(segments))
}

fn canonical_host(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|group| format!("{group:x}"))
            .collect::<Vec<_>>()
            .join(":"),
    }
}

fn write_family(buf: &mut [u8], family: AddressFamily) {
    let raw = family.raw();
    if HAS_SA_LEN {
        buf[0] = family.sockaddr_len() as u8;
        buf[1] = raw as u8;
    } else {
        buf[..2].copy_from_slice(&raw.to_ne_bytes());
    }
}

fn read_family(buf: &[u8]) -> u16 {
    if HAS_SA_LEN {
        u16::from(buf[1])
    } else {
        u16::from_ne_bytes([buf[0], buf[1]])
    }
}

fn encode_ip(ip: IpAddr, port: u16) -> Box<[u8]> {
    match ip {
        IpAddr::V4(v4) => {
            let mut buf = [0u8; SOCKADDR_IN_LEN];
            write_family(&mut buf, AddressFamily::V4);
            buf[2..4].copy_from_slice(&port.to_be_bytes());
            buf[4..8].copy_from_slice(&v4.octets());
            Box::new(buf)
        }
        IpAddr::V6(v6) => {
            let mut buf = [0u8; SOCKADDR_IN6_LEN];
            write_family(&mut buf, AddressFamily::V6);
            buf[2..4].copy_from_slice(&port.to_be_bytes());
            // Bytes 4..8 are sin6_flowinfo and 24..28 sin6_scope_id; both stay zero.
            buf[8..24].copy_from_slice(&v6.octets());
            Box::new(buf)
        }
    }
}
