use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(addr));
        }
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(addr));
        }
        if s.is_empty() || s.len() > 255 || s.contains(':') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse address: {}", s),
            ));
        }
        Ok(Address::Hostname(s.to_string()))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(ref hostname) => Some(hostname),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
            Address::Hostname(hostname) => hostname.fmt(f),
        }
    }
}

/// An address and port pair, where the address can be an unresolved hostname.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// Parses `host:port`, `[v6]:port`, or a bare host when `default_port` is
    /// provided. This accepts the same shapes that `SocketAddr`'s `Display`
    /// produces, since proxied UDP addresses round-trip through strings.
    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        if let Some(rest) = s.strip_prefix('[') {
            let (address_str, port_str) = rest.split_once(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unterminated bracketed address: {}", s),
                )
            })?;
            let port = match port_str.strip_prefix(':') {
                Some(p) => p.parse::<u16>().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid port in address: {}", s),
                    )
                })?,
                None => default_port.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "no port")
                })?,
            };
            let addr = address_str.parse::<Ipv6Addr>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid bracketed address: {}", s),
                )
            })?;
            return Ok(Self::new(Address::Ipv6(addr), port));
        }

        // a lone colon could belong to a bare ipv6 address rather than a port.
        let (address_str, port) = match s.rfind(':') {
            Some(i) if s[..i].contains(':') => (s, default_port),
            Some(i) => match s[i + 1..].parse::<u16>() {
                Ok(port) => (&s[..i], Some(port)),
                Err(_) => (s, default_port),
            },
            None => (s, default_port),
        };

        let address = Address::from(address_str)?;
        let port =
            port.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no port"))?;

        Ok(Self { address, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let address = match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip),
            IpAddr::V6(ip) => Address::Ipv6(ip),
        };
        Self {
            address,
            port: addr.port(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the socket address without resolving, when the address is
    /// already an IP.
    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ipv4(addr) => Some(SocketAddr::new(IpAddr::V4(addr), self.port)),
            Address::Ipv6(addr) => Some(SocketAddr::new(IpAddr::V6(addr), self.port)),
            Address::Hostname(_) => None,
        }
    }
}

impl fmt::Display for NetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Address::Ipv6(ref addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}
