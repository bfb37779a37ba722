use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

/// Destination or source descriptor.
///
/// A hostname and a resolved address may both be present: resolution fills in
/// `address` while the hostname is kept for logging. The port is independent
/// state and may be known before any address is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressIdentity {
    pub hostname: Option<String>,
    pub address: Option<IpAddr>,
    pub port: u16,
}

impl AddressIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hostname(name: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: Some(name.into()),
            address: None,
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            hostname: None,
            address: Some(addr.ip()),
            port: addr.port(),
        }
    }

    pub fn from_ipv4_octets(octets: [u8; 4], port: u16) -> Self {
        Self {
            hostname: None,
            address: Some(IpAddr::V4(Ipv4Addr::from(octets))),
            port,
        }
    }

    pub fn from_ipv6_octets(octets: [u8; 16], port: u16) -> Self {
        Self {
            hostname: None,
            address: Some(IpAddr::V6(Ipv6Addr::from(octets))),
            port,
        }
    }

    /// True once either a hostname or an address is known.
    pub fn is_addressable(&self) -> bool {
        self.hostname.is_some() || self.address.is_some()
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.address {
            Some(IpAddr::V4(v4)) => Some(v4),
            _ => None,
        }
    }

    /// Host-order IPv4 value, for mask arithmetic.
    pub fn ipv4_u32(&self) -> Option<u32> {
        self.ipv4().map(u32::from)
    }

    /// Replace the address with an IPv4 value and drop the hostname.
    pub fn with_ipv4_u32(&mut self, value: u32) {
        self.address = Some(IpAddr::V4(Ipv4Addr::from(value)));
        self.hostname = None;
    }

    pub fn address_string(&self) -> Option<String> {
        self.address.map(|a| a.to_string())
    }

    /// Name if known, otherwise the address.
    pub fn host(&self) -> String {
        match (&self.hostname, &self.address) {
            (Some(name), _) => name.clone(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn host_port(&self) -> String {
        match self.address {
            Some(IpAddr::V6(v6)) if self.hostname.is_none() => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host(), self.port),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.map(|a| SocketAddr::new(a, self.port))
    }
}

impl fmt::Display for AddressIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.hostname.as_deref().unwrap_or(""),
            self.port,
            self.address_string().unwrap_or_default()
        )
    }
}
