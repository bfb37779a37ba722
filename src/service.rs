use std::fmt;
use std::net::SocketAddr;

use crate::address::AddressIdentity;
use crate::config::ServiceSpec;
use crate::session::Session;
use crate::socks::{AddressType, Command, SocksVersion};

/// What a listener does with an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    /// SOCKS4/SOCKS5 server
    Socks,
    /// Static forward to a fixed remote host, routed through the rules like a SOCKS CONNECT
    PortForward { remote_host: String, remote_port: u16 },
}

#[derive(Debug, Clone)]
pub struct Service {
    pub id: u32,
    pub bind: SocketAddr,
    pub kind: ServiceKind,
}

impl Service {
    pub fn from_spec(id: u32, spec: &ServiceSpec) -> Self {
        match spec {
            ServiceSpec::Socks { bind, port } => Self {
                id,
                bind: SocketAddr::new(*bind, *port),
                kind: ServiceKind::Socks,
            },
            ServiceSpec::PortForward {
                bind,
                port,
                remote_host,
                remote_port,
            } => Self {
                id,
                bind: SocketAddr::new(*bind, *port),
                kind: ServiceKind::PortForward {
                    remote_host: remote_host.clone(),
                    remote_port: *remote_port,
                },
            },
        }
    }

    /// Fill a port-forward session as if the client had sent a SOCKS5
    /// CONNECT for the remote host by name.
    pub fn prepare_forward(&self, session: &Session) -> bool {
        let ServiceKind::PortForward {
            remote_host,
            remote_port,
        } = &self.kind
        else {
            return false;
        };

        let destination = AddressIdentity::from_hostname(remote_host.clone(), *remote_port);
        {
            let mut st = session.lock();
            st.socks_version = Some(SocksVersion::V5);
            st.command = Some(Command::Connect);
            st.command_original = Some(Command::Connect);
            st.address_type = Some(AddressType::Domain);
            st.address_type_original = Some(AddressType::Domain);
            st.destination = destination.clone();
        }
        session.set_destination_original(destination);
        true
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ServiceKind::Socks => write!(f, "socks/{}", self.bind),
            ServiceKind::PortForward {
                remote_host,
                remote_port,
            } => write!(f, "forward/{}->{}:{}", self.bind, remote_host, remote_port),
        }
    }
}
