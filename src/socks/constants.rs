//! SOCKS4 and SOCKS5 wire constants (RFC 1928 and the SOCKS4 protocol note).

use serde::Serialize;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_GSSAPI: u8 = 0x01;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
/// Server rejects every offered method
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS4 "request granted"
pub const SOCKS4_GRANTED: u8 = 0x5A;
/// SOCKS4 "request rejected or failed"
pub const SOCKS4_REJECTED: u8 = 0x5B;

/// Upper bound on a SOCKS4 user id before the request is treated as malformed.
pub const SOCKS4_MAX_USERID: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocksVersion {
    V4,
    V5,
}

impl SocksVersion {
    pub fn number(self) -> u8 {
        match self {
            SocksVersion::V4 => SOCKS4_VERSION,
            SocksVersion::V5 => SOCKS5_VERSION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressType {
    Ipv4,
    Domain,
    Ipv6,
}

impl AddressType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::Domain),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            AddressType::Ipv4 => 0x01,
            AddressType::Domain => 0x03,
            AddressType::Ipv6 => 0x04,
        }
    }
}

/// SOCKS5 reply field (RFC 1928 section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplyCode {
    Succeeded,
    ServerFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unassigned(u8),
}

impl ReplyCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::ServerFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unassigned(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ReplyCode::Succeeded => 0x00,
            ReplyCode::ServerFailure => 0x01,
            ReplyCode::NotAllowed => 0x02,
            ReplyCode::NetworkUnreachable => 0x03,
            ReplyCode::HostUnreachable => 0x04,
            ReplyCode::ConnectionRefused => 0x05,
            ReplyCode::TtlExpired => 0x06,
            ReplyCode::CommandNotSupported => 0x07,
            ReplyCode::AddressTypeNotSupported => 0x08,
            ReplyCode::Unassigned(b) => b,
        }
    }

    pub fn is_success(self) -> bool {
        self == ReplyCode::Succeeded
    }
}
