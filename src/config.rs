use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::rules::{parse_rule_lines, Provenance, RouteRule};
use crate::tunnel::TunnelRegistry;

const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("{provenance}: {message}")]
    Rule { provenance: String, message: String },
}

/// Top-level proxy configuration, read from a JSON file and/or built from
/// command-line spec strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub log_level: Option<String>,
    pub services: Vec<ServiceSpec>,
    pub tunnels: Vec<TunnelSpec>,
    /// Inline rules, one rule per entry
    pub rules: Vec<String>,
    /// Additional rules file, one rule per line, relative to the config file
    pub rules_file: Option<PathBuf>,
    pub connect: ConnectSettings,
    pub relay: RelaySettings,
    pub dns: DnsSettings,
    pub session_loiter_secs: u64,
    pub supervisor: SupervisorSettings,
    /// Where this configuration came from, for rule provenance
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            services: Vec::new(),
            tunnels: Vec::new(),
            rules: Vec::new(),
            rules_file: None,
            connect: ConnectSettings::default(),
            relay: RelaySettings::default(),
            dns: DnsSettings::default(),
            session_loiter_secs: 4,
            supervisor: SupervisorSettings::default(),
            source: None,
        }
    }
}

/// A listener and what it does with accepted connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceSpec {
    Socks {
        #[serde(default = "default_bind")]
        bind: IpAddr,
        port: u16,
    },
    PortForward {
        #[serde(default = "default_bind")]
        bind: IpAddr,
        port: u16,
        remote_host: String,
        remote_port: u16,
    },
}

/// A chained tunnel: a supervised command exposing SOCKS5 on `127.0.0.1:socks_port`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSpec {
    pub name: String,
    pub socks_port: u16,
    #[serde(default)]
    pub command: Option<String>,
}

/// What to do when a route names a single tunnel and it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleCandidate {
    /// Retry the same tunnel up to `max_attempts`
    #[default]
    Cycle,
    /// Give up after one attempt
    FailFast,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectSettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Per-attempt connect and relay handshake timeout
    pub timeout_secs: u64,
    pub single_candidate: SingleCandidate,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            backoff_ms: 100,
            timeout_secs: 10,
            single_candidate: SingleCandidate::Cycle,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySettings {
    pub buffer_size: usize,
    /// Close a relay that moved no data for this long; unset means never
    pub idle_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            idle_timeout_secs: None,
            handshake_timeout_secs: 30,
        }
    }
}

impl RelaySettings {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    System,
    Doh,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsSettings {
    pub resolver: ResolverKind,
    pub doh_url: Option<String>,
    /// Retries on a temporary ("try again") lookup failure
    pub retries: u32,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            resolver: ResolverKind::System,
            doh_url: None,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    pub restart_delay_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: 1000,
            restart_delay_secs: 2,
        }
    }
}

fn default_bind() -> IpAddr {
    DEFAULT_BIND
}

fn parse_port(s: &str, what: &str) -> Result<u16, ConfigError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::Invalid(format!("invalid {what} '{s}'"))),
        Ok(p) => Ok(p),
    }
}

fn parse_bind(s: &str) -> Result<IpAddr, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid bind address '{s}'")))
}

impl ServiceSpec {
    /// `[bind:]port`
    pub fn parse_socks(s: &str) -> Result<Self, ConfigError> {
        let (bind, port) = match s.rsplit_once(':') {
            Some((bind, port)) => (parse_bind(bind)?, port),
            None => (DEFAULT_BIND, s),
        };
        Ok(ServiceSpec::Socks {
            bind,
            port: parse_port(port, "port")?,
        })
    }

    /// `[bind:]lport:rhost:rport`
    pub fn parse_forward(s: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = s.split(':').collect();
        let (bind, rest) = match parts.len() {
            3 => (DEFAULT_BIND, &parts[..]),
            4 => (parse_bind(parts[0])?, &parts[1..]),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "port forward '{s}' is not [bind:]lport:rhost:rport"
                )))
            }
        };
        if rest[1].is_empty() {
            return Err(ConfigError::Invalid(format!("port forward '{s}' has no remote host")));
        }
        Ok(ServiceSpec::PortForward {
            bind,
            port: parse_port(rest[0], "local port")?,
            remote_host: rest[1].to_string(),
            remote_port: parse_port(rest[2], "remote port")?,
        })
    }

    pub fn port(&self) -> u16 {
        match self {
            ServiceSpec::Socks { port, .. } | ServiceSpec::PortForward { port, .. } => *port,
        }
    }
}

impl FromStr for TunnelSpec {
    type Err = ConfigError;

    /// `name:socksport:command`; the command may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let name = parts.next().unwrap_or_default();
        let port = parts.next().ok_or_else(|| {
            ConfigError::Invalid(format!("tunnel '{s}' is not name:socksport:command"))
        })?;
        if name.is_empty() {
            return Err(ConfigError::Invalid(format!("tunnel '{s}' has no name")));
        }
        Ok(TunnelSpec {
            name: name.to_string(),
            socks_port: parse_port(port, "SOCKS port")?,
            command: parts.next().filter(|c| !c.is_empty()).map(str::to_string),
        })
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("no services configured".into()));
        }
        for service in &self.services {
            if service.port() == 0 {
                return Err(ConfigError::Invalid(format!("service {service:?} has port 0")));
            }
            if let ServiceSpec::PortForward {
                remote_host,
                remote_port,
                ..
            } = service
            {
                if remote_host.is_empty() || *remote_port == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "port forward {service:?} needs a remote host and port"
                    )));
                }
            }
        }
        if self.connect.max_attempts == 0 {
            return Err(ConfigError::Invalid("connect.max_attempts must be at least 1".into()));
        }
        if self.relay.buffer_size == 0 {
            return Err(ConfigError::Invalid("relay.buffer_size must be positive".into()));
        }
        if self.dns.resolver == ResolverKind::Doh && self.dns.doh_url.is_none() {
            return Err(ConfigError::Invalid("dns.resolver is doh but no doh_url given".into()));
        }
        // Names and ports are checked when the registry is built.
        TunnelRegistry::from_specs(&self.tunnels)?;
        Ok(())
    }

    pub fn session_loiter(&self) -> Duration {
        Duration::from_secs(self.session_loiter_secs)
    }

    /// Inline rules first, then the rules file, in declaration order.
    pub fn load_rules(&self, registry: &TunnelRegistry) -> Result<Vec<RouteRule>, ConfigError> {
        let label = self
            .source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<command line>".to_string());

        let mut rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, line)| RouteRule::parse(line, registry, Provenance::new(label.clone(), i + 1)))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(file) = &self.rules_file {
            let path = match self.source.as_ref().and_then(|p| p.parent()) {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            rules.extend(parse_rule_lines(&text, &path.display().to_string(), registry)?);
        }
        debug!("loaded {} route rules", rules.len());
        Ok(rules)
    }
}

/// Read a JSON configuration file. Validation is left to the caller, since
/// command-line services may still be merged in.
pub fn load_config(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let path = path.as_ref();
    debug!("loading configuration from {:?}", path);

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut config: ProxyConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
    config.source = Some(path.to_path_buf());

    info!(
        "configuration loaded: {} services, {} tunnels, {} inline rules",
        config.services.len(),
        config.tunnels.len(),
        config.rules.len()
    );
    Ok(config)
}
