use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::dns_resolver::DnsError;
use crate::socks::constants::ReplyCode;

/// Per-connection failure taxonomy.
///
/// None of these are fatal to the process: the handler closes the session's
/// sockets, records a status and moves on.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or unsupported client handshake
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("address type not supported")]
    AddressTypeNotSupported,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset")]
    ConnectionReset,

    #[error("timed out")]
    Timeout,

    /// Upstream SOCKS5 relay answered with a non-success reply
    #[error("relay replied {0:?}")]
    RelayReply(ReplyCode),

    #[error("internal consistency failure: {0}")]
    InternalConsistency(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ProxyError::Protocol(msg.into())
    }

    /// Whether retrying the same candidate could succeed.
    ///
    /// Only an unsupported address type and an internal failure are
    /// permanent; a relay that misbehaves once may be restarted.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ProxyError::AddressTypeNotSupported | ProxyError::InternalConsistency(_)
        )
    }

    /// SOCKS5 reply code reported to the client for this failure.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ProxyError::AddressTypeNotSupported => ReplyCode::AddressTypeNotSupported,
            ProxyError::ConnectionRefused | ProxyError::ConnectionReset => {
                ReplyCode::ConnectionRefused
            }
            ProxyError::Timeout => ReplyCode::HostUnreachable,
            ProxyError::RelayReply(code) => *code,
            ProxyError::Dns(_) => ReplyCode::HostUnreachable,
            ProxyError::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                    ReplyCode::ConnectionRefused
                }
                io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
                _ => ReplyCode::ServerFailure,
            },
            _ => ReplyCode::ServerFailure,
        }
    }

    /// Classify a socket error from an outbound connect.
    pub fn from_connect(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ProxyError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ProxyError::ConnectionReset,
            io::ErrorKind::TimedOut => ProxyError::Timeout,
            _ => ProxyError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
