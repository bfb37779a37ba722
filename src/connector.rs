use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::address::AddressIdentity;
use crate::config::{ConnectSettings, SingleCandidate};
use crate::dns_resolver::Resolver;
use crate::error::{ProxyError, Result};
use crate::session::{Session, StatusCode};
use crate::socks::constants::{AUTH_METHOD_NONE, SOCKS5_VERSION};
use crate::socks::{AddressType, Command, ReplyCode};
use crate::tunnel::{ChainedTunnel, Tunnel};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub connect_timeout: Duration,
    pub single_candidate: SingleCandidate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ConnectSettings::default())
    }
}

impl From<&ConnectSettings> for RetryPolicy {
    fn from(s: &ConnectSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            backoff: Duration::from_millis(s.backoff_ms),
            connect_timeout: Duration::from_secs(s.timeout_secs),
            single_candidate: s.single_candidate,
        }
    }
}

/// One try against one candidate.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub tunnel: String,
    pub error: Option<String>,
}

/// Established outbound leg.
#[derive(Debug)]
pub struct Connected {
    /// None for the null tunnel
    pub outbound: Option<TcpStream>,
    pub reply: ReplyCode,
    pub bound: Option<SocketAddr>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Error)]
#[error("{error} after {} attempt(s)", .attempts.len())]
pub struct ConnectFailure {
    pub error: ProxyError,
    pub reply: ReplyCode,
    pub attempts: Vec<Attempt>,
}

/// Establishes the outbound leg for a routed session.
pub struct TunnelConnector {
    policy: RetryPolicy,
    resolver: Arc<dyn Resolver>,
}

impl TunnelConnector {
    pub fn new(policy: RetryPolicy, resolver: Arc<dyn Resolver>) -> Self {
        Self { policy, resolver }
    }

    /// Try the route's tunnels cyclically until one connects.
    ///
    /// `session.tunnel` names the candidate for the duration of each
    /// attempt and is cleared again when it fails, so it is only left set
    /// on success.
    pub async fn connect(
        &self,
        session: &Session,
    ) -> std::result::Result<Connected, ConnectFailure> {
        let route = session.lock().route.clone();
        let tunnels = match route {
            Some(route) if !route.tunnels.is_empty() => route.tunnels.clone(),
            Some(route) => {
                error!(route = %route.provenance, "route has no tunnels");
                return Err(Self::failure(
                    ProxyError::InternalConsistency("route has no tunnels".into()),
                    Vec::new(),
                ));
            }
            None => {
                error!("connect called before a route was assigned");
                return Err(Self::failure(
                    ProxyError::InternalConsistency("no route assigned".into()),
                    Vec::new(),
                ));
            }
        };

        let max_attempts = match (tunnels.len(), self.policy.single_candidate) {
            (1, SingleCandidate::FailFast) => 1,
            _ => self.policy.max_attempts.max(1),
        };

        let mut attempts = Vec::new();
        let mut exhausted = vec![false; tunnels.len()];
        let mut last_error = None;

        for i in 0..max_attempts as usize {
            if exhausted.iter().all(|d| *d) {
                break;
            }
            let idx = i % tunnels.len();
            if exhausted[idx] {
                continue;
            }
            let candidate = tunnels[idx].clone();

            {
                let mut st = session.lock();
                st.tunnel = Some(candidate.clone());
            }
            session.set_status(
                StatusCode::Okay,
                "Connecting",
                format!("Connecting via {}", candidate.name()),
            );
            debug!(tunnel = candidate.name(), attempt = i + 1, "connecting");

            match self.attempt(session, &candidate).await {
                Ok((outbound, bound)) => {
                    attempts.push(Attempt {
                        tunnel: candidate.name().to_string(),
                        error: None,
                    });
                    {
                        let mut st = session.lock();
                        st.outbound_open = outbound.is_some();
                        if let Tunnel::Chained(t) = &candidate {
                            t.connection_opened();
                        }
                    }
                    info!(
                        tunnel = candidate.name(),
                        destination = %session.destination().host_port(),
                        "connected"
                    );
                    return Ok(Connected {
                        outbound,
                        reply: ReplyCode::Succeeded,
                        bound,
                        attempts,
                    });
                }
                Err(e) => {
                    session.lock().tunnel = None;
                    warn!(tunnel = candidate.name(), attempt = i + 1, "connect failed: {}", e);
                    attempts.push(Attempt {
                        tunnel: candidate.name().to_string(),
                        error: Some(e.to_string()),
                    });
                    if !e.is_recoverable() {
                        exhausted[idx] = true;
                    }
                    last_error = Some(e);
                    if i + 1 < max_attempts as usize && !exhausted.iter().all(|d| *d) {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            ProxyError::InternalConsistency("no connection attempt was made".into())
        });
        Err(Self::failure(error, attempts))
    }

    fn failure(error: ProxyError, attempts: Vec<Attempt>) -> ConnectFailure {
        ConnectFailure {
            reply: error.reply_code(),
            error,
            attempts,
        }
    }

    async fn attempt(
        &self,
        session: &Session,
        tunnel: &Tunnel,
    ) -> Result<(Option<TcpStream>, Option<SocketAddr>)> {
        match tunnel {
            Tunnel::Null => Ok((None, None)),
            Tunnel::Direct => {
                let stream = self.connect_direct(session).await?;
                let bound = stream.local_addr().ok();
                Ok((Some(stream), bound))
            }
            Tunnel::Chained(t) => {
                let (stream, bound) = timeout(
                    self.policy.connect_timeout,
                    self.connect_chained(session, t),
                )
                .await
                .map_err(|_| ProxyError::Timeout)??;
                Ok((Some(stream), bound))
            }
        }
    }

    async fn connect_direct(&self, session: &Session) -> Result<TcpStream> {
        let dest = session.destination();
        let addr = match (dest.address, &dest.hostname) {
            (Some(addr), _) => addr,
            (None, Some(name)) => match name.parse::<Ipv4Addr>() {
                Ok(v4) => IpAddr::V4(v4),
                Err(_) => {
                    let resolved = self.resolver.resolve(&dest).await?;
                    let addr = resolved.address.ok_or(ProxyError::AddressTypeNotSupported)?;
                    session.lock().destination.address = Some(addr);
                    addr
                }
            },
            (None, None) => return Err(ProxyError::AddressTypeNotSupported),
        };
        let IpAddr::V4(v4) = addr else {
            return Err(ProxyError::AddressTypeNotSupported);
        };

        open_stream(SocketAddr::new(IpAddr::V4(v4), dest.port), self.policy.connect_timeout).await
    }

    /// Client side of SOCKS5 against the tunnel's local listener.
    async fn connect_chained(
        &self,
        session: &Session,
        tunnel: &ChainedTunnel,
    ) -> Result<(TcpStream, Option<SocketAddr>)> {
        let relay = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), tunnel.socks_port());
        let mut stream = open_stream(relay, self.policy.connect_timeout).await?;

        let (destination, address_type) = {
            let st = session.lock();
            (st.destination.clone(), st.address_type)
        };
        let request = build_connect_request(&destination, address_type)?;

        stream
            .write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
            .await?;
        let mut method = [0u8; 2];
        read_relay(&mut stream, &mut method).await?;
        trace!(?method, "relay method selection");
        if method != [SOCKS5_VERSION, AUTH_METHOD_NONE] {
            return Err(ProxyError::protocol(format!(
                "relay {} rejected no-auth negotiation: {:?}",
                tunnel.name(),
                method
            )));
        }

        stream.write_all(&request).await?;
        let bound = read_connect_reply(&mut stream).await?;
        debug!(tunnel = tunnel.name(), ?bound, "relay accepted CONNECT");
        Ok((stream, bound))
    }
}

/// TCP connect with keepalive and no Nagle.
async fn open_stream(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(ProxyError::from_connect)?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        debug!("failed to set keepalive on {}: {}", addr, e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY on {}: {}", addr, e);
    }
    Ok(stream)
}

/// EOF from the relay mid-handshake means the tunnel is not really there.
async fn read_relay<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProxyError::ConnectionRefused),
        Err(e) => Err(ProxyError::from_connect(e)),
    }
}

fn build_connect_request(
    destination: &AddressIdentity,
    address_type: Option<AddressType>,
) -> Result<Vec<u8>> {
    let mut request = vec![SOCKS5_VERSION, Command::Connect.as_byte(), 0x00];

    let by_name = match (&destination.hostname, destination.ipv4()) {
        (Some(name), _) if address_type == Some(AddressType::Domain) => Some(name),
        (_, Some(v4)) => {
            request.push(AddressType::Ipv4.as_byte());
            request.extend_from_slice(&v4.octets());
            None
        }
        (Some(name), None) if destination.address.is_none() => Some(name),
        _ => return Err(ProxyError::AddressTypeNotSupported),
    };

    if let Some(name) = by_name {
        let len = u8::try_from(name.len())
            .map_err(|_| ProxyError::protocol(format!("hostname too long: {} bytes", name.len())))?;
        request.push(AddressType::Domain.as_byte());
        request.push(len);
        request.extend_from_slice(name.as_bytes());
    }

    request.extend_from_slice(&destination.port.to_be_bytes());
    Ok(request)
}

async fn read_connect_reply<S>(stream: &mut S) -> Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_relay(stream, &mut header).await?;
    trace!(?header, "relay reply header");

    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::protocol(format!(
            "relay replied with version {:#04x}",
            header[0]
        )));
    }
    let reply = ReplyCode::from_byte(header[1]);
    if !reply.is_success() {
        return Err(ProxyError::RelayReply(reply));
    }

    let ip = match AddressType::from_byte(header[3]) {
        Some(AddressType::Ipv4) => {
            let mut a = [0u8; 4];
            read_relay(stream, &mut a).await?;
            Some(IpAddr::from(a))
        }
        Some(AddressType::Ipv6) => {
            let mut a = [0u8; 16];
            read_relay(stream, &mut a).await?;
            Some(IpAddr::from(a))
        }
        Some(AddressType::Domain) => {
            let mut len = [0u8; 1];
            read_relay(stream, &mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            read_relay(stream, &mut name).await?;
            None
        }
        None => {
            return Err(ProxyError::protocol(format!(
                "relay replied with address type {:#04x}",
                header[3]
            )))
        }
    };
    let mut port = [0u8; 2];
    read_relay(stream, &mut port).await?;
    Ok(ip.map(|ip| SocketAddr::new(ip, u16::from_be_bytes(port))))
}
