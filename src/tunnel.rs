use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{ConfigError, TunnelSpec};

pub const DIRECT_NAME: &str = "direct";
pub const NULL_NAME: &str = "null";

const DIRECT_ID: u32 = 0;
const NULL_ID: u32 = 1;
const FIRST_CHAINED_ID: u32 = 2;

/// How the outbound leg of a session is established.
#[derive(Clone)]
pub enum Tunnel {
    /// Plain TCP connect to the destination
    Direct,
    /// Accept and discard; no outbound socket
    Null,
    /// Through the local SOCKS5 listener of a supervised subprocess
    Chained(Arc<ChainedTunnel>),
}

impl Tunnel {
    pub fn id(&self) -> u32 {
        match self {
            Tunnel::Direct => DIRECT_ID,
            Tunnel::Null => NULL_ID,
            Tunnel::Chained(t) => t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Tunnel::Direct => DIRECT_NAME,
            Tunnel::Null => NULL_NAME,
            Tunnel::Chained(t) => &t.name,
        }
    }

    pub fn as_chained(&self) -> Option<&Arc<ChainedTunnel>> {
        match self {
            Tunnel::Chained(t) => Some(t),
            _ => None,
        }
    }
}

impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Tunnel {}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tunnel::Chained(t) => write!(f, "Chained({}:{})", t.name, t.socks_port),
            other => f.write_str(other.name()),
        }
    }
}

/// A tunnel backed by an external process exposing SOCKS5 on localhost.
#[derive(Debug)]
pub struct ChainedTunnel {
    id: u32,
    name: String,
    socks_port: u16,
    command: Option<String>,
    /// Relays currently running through this tunnel
    connection_count: AtomicU64,
    /// Demand mark set by the supervisor sweep
    mark: AtomicBool,
}

impl ChainedTunnel {
    pub fn new(id: u32, name: impl Into<String>, socks_port: u16, command: Option<String>) -> Self {
        Self {
            id,
            name: name.into(),
            socks_port,
            command,
            connection_count: AtomicU64::new(0),
            mark: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Callers hold the owning session's lock.
    pub fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connection_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn set_mark(&self) {
        self.mark.store(true, Ordering::Relaxed);
    }

    /// Read and clear the demand mark.
    pub fn take_mark(&self) -> bool {
        self.mark.swap(false, Ordering::Relaxed)
    }
}

/// Named tunnels known to a proxy, created once from configuration.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    chained: Vec<Arc<ChainedTunnel>>,
}

impl TunnelRegistry {
    pub fn from_specs(specs: &[TunnelSpec]) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for spec in specs {
            registry.add(spec)?;
        }
        Ok(registry)
    }

    pub fn add(&mut self, spec: &TunnelSpec) -> Result<Arc<ChainedTunnel>, ConfigError> {
        if spec.name == DIRECT_NAME || spec.name == NULL_NAME {
            return Err(ConfigError::Invalid(format!(
                "tunnel name '{}' is reserved",
                spec.name
            )));
        }
        if self.chained.iter().any(|t| t.name == spec.name) {
            return Err(ConfigError::Invalid(format!(
                "duplicate tunnel name '{}'",
                spec.name
            )));
        }
        if spec.socks_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "tunnel '{}' has no SOCKS port",
                spec.name
            )));
        }
        let id = FIRST_CHAINED_ID + self.chained.len() as u32;
        let tunnel = Arc::new(ChainedTunnel::new(
            id,
            spec.name.clone(),
            spec.socks_port,
            spec.command.clone(),
        ));
        self.chained.push(Arc::clone(&tunnel));
        Ok(tunnel)
    }

    /// Resolve a `via` name, including the built-in "direct" and "null".
    pub fn lookup(&self, name: &str) -> Option<Tunnel> {
        match name {
            DIRECT_NAME => Some(Tunnel::Direct),
            NULL_NAME => Some(Tunnel::Null),
            _ => self
                .chained
                .iter()
                .find(|t| t.name == name)
                .map(|t| Tunnel::Chained(Arc::clone(t))),
        }
    }

    pub fn chained(&self) -> &[Arc<ChainedTunnel>] {
        &self.chained
    }
}
