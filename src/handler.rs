use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::connector::TunnelConnector;
use crate::error::{ProxyError, Result};
use crate::rules::RouteRuleEngine;
use crate::service::ServiceKind;
use crate::session::{Session, StatusCode};
use crate::shuttle::{Shuttle, ShuttleExit};
use crate::socks::{encode_failure, encode_reply, parse_handshake};
use crate::teardown::safe_close;

/// Everything a connection handler needs, shared by all sessions of a proxy.
pub struct ProxyContext {
    pub engine: RouteRuleEngine,
    pub connector: TunnelConnector,
    pub shuttle: Shuttle,
    pub handshake_timeout: Duration,
}

/// Drive one accepted connection from handshake to teardown.
///
/// Failures stay local to the session: they are logged, recorded in its
/// status, and the sockets are closed.
pub async fn handle_connection(ctx: Arc<ProxyContext>, session: Arc<Session>, inbound: TcpStream) {
    let session = scopeguard::guard(session, |s| s.mark_exited());
    let mut inbound = inbound;
    let mut outbound = None;

    match serve(&ctx, &session, &mut inbound, &mut outbound).await {
        Ok(exit) => {
            let st = session.snapshot().state;
            info!(
                ?exit,
                bytes_tx = st.bytes_tx,
                bytes_rx = st.bytes_rx,
                "session finished"
            );
            session.set_status(StatusCode::Okay, "Closed", "");
        }
        Err(e) => record_failure(&session, &e),
    }

    if let Some(stream) = outbound.take() {
        if let Some(tunnel) = session.tunnel() {
            if let Some(chained) = tunnel.as_chained() {
                chained.connection_closed();
            }
        }
        safe_close(stream).await;
    }
    safe_close(inbound).await;
}

fn record_failure(session: &Session, e: &ProxyError) {
    let code = match e {
        ProxyError::Protocol(_) => {
            debug!("handshake failed: {}", e);
            StatusCode::Error
        }
        ProxyError::InternalConsistency(_) => {
            error!("{}", e);
            StatusCode::ErrInternal
        }
        _ => {
            warn!("session failed: {}", e);
            StatusCode::ErrNetwork
        }
    };
    session.set_status(code, "Error", e.to_string());
}

async fn serve(
    ctx: &ProxyContext,
    session: &Session,
    inbound: &mut TcpStream,
    outbound: &mut Option<TcpStream>,
) -> Result<ShuttleExit> {
    let speaks_socks = match &session.service().kind {
        ServiceKind::Socks => {
            session.set_status(StatusCode::Okay, "Negotiating", "");
            timeout(ctx.handshake_timeout, parse_handshake(session, inbound))
                .await
                .map_err(|_| ProxyError::Timeout)??;
            true
        }
        ServiceKind::PortForward { .. } => {
            session.service().prepare_forward(session);
            false
        }
    };

    let decision = ctx.engine.decide(session).await;
    if decision.explicit_match {
        debug!(route = %decision.route, "route selected");
    } else {
        debug!("no rule matched, using direct");
    }

    let connected = match ctx.connector.connect(session).await {
        Ok(connected) => connected,
        Err(failure) => {
            if speaks_socks {
                let _ = encode_failure(session, inbound, failure.reply).await;
            }
            return Err(failure.error);
        }
    };

    // Owned by the caller from here on, so a failed reply still closes it.
    *outbound = connected.outbound;
    if speaks_socks {
        encode_reply(session, inbound, connected.reply, connected.bound).await?;
    }

    let via = session
        .tunnel()
        .map(|t| t.name().to_string())
        .unwrap_or_default();
    session.set_status(StatusCode::Okay, "Connected", format!("Relaying via {via}"));

    ctx.shuttle.run(session, inbound, outbound.as_mut()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressIdentity;
    use crate::config::{ServiceSpec, SingleCandidate, TunnelSpec};
    use crate::connector::RetryPolicy;
    use crate::dns_resolver::SystemResolver;
    use crate::rules::{Provenance, RouteRule};
    use crate::service::Service;
    use crate::tunnel::TunnelRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context(rules: Vec<RouteRule>) -> Arc<ProxyContext> {
        let resolver = Arc::new(SystemResolver::default());
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
            connect_timeout: Duration::from_secs(2),
            single_candidate: SingleCandidate::FailFast,
        };
        Arc::new(ProxyContext {
            engine: RouteRuleEngine::new(rules, resolver.clone()),
            connector: TunnelConnector::new(policy, resolver),
            shuttle: Shuttle::default(),
            handshake_timeout: Duration::from_secs(5),
        })
    }

    /// Accept one client connection and hand it to a spawned handler.
    async fn start(
        ctx: Arc<ProxyContext>,
        spec: ServiceSpec,
    ) -> (TcpStream, Arc<Session>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (inbound, peer) = listener.accept().await.unwrap();

        let service = Arc::new(Service::from_spec(1, &spec));
        let session = Arc::new(Session::new(service, AddressIdentity::from_socket_addr(peer)));
        let handle = tokio::spawn(handle_connection(ctx, Arc::clone(&session), inbound));
        (client, session, handle)
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = w.shutdown().await;
        });
        port
    }

    fn socks_spec() -> ServiceSpec {
        ServiceSpec::Socks {
            bind: "127.0.0.1".parse().unwrap(),
            port: 1080,
        }
    }

    #[tokio::test]
    async fn test_socks4_direct_end_to_end() {
        let port = echo_server().await;
        let (mut client, session, handle) = start(context(vec![]), socks_spec()).await;

        let mut req = vec![4, 1];
        req.extend_from_slice(&port.to_be_bytes());
        req.extend_from_slice(&[127, 0, 0, 1, 0]);
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 0x5A, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        handle.await.unwrap();

        let snap = session.snapshot();
        assert!(snap.state.exited);
        assert_eq!(snap.state.bytes_tx, 4);
        assert_eq!(snap.state.bytes_rx, 4);
        assert_eq!(snap.state.status.code, StatusCode::Okay);
        assert_eq!(session.tunnel(), Some(crate::tunnel::Tunnel::Direct));
    }

    #[tokio::test]
    async fn test_port_forward_to_null_sink() {
        let registry = TunnelRegistry::default();
        let rule = RouteRule::parse("is sink.test via null", &registry, Provenance::new("t", 1)).unwrap();
        let spec = ServiceSpec::PortForward {
            bind: "127.0.0.1".parse().unwrap(),
            port: 2222,
            remote_host: "sink.test".into(),
            remote_port: 9,
        };
        let (mut client, session, handle) = start(context(vec![rule]), spec).await;

        client.write_all(b"thrown away").await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        handle.await.unwrap();

        let snap = session.snapshot();
        assert_eq!(snap.state.bytes_rx, 11);
        assert_eq!(snap.state.bytes_tx, 0);
        assert!(!snap.state.outbound_open);
        assert_eq!(snap.destination_original.unwrap().host_port(), "sink.test:9");
    }

    #[tokio::test]
    async fn test_connect_failure_sends_socks5_error() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let registry = TunnelRegistry::from_specs(&[TunnelSpec {
            name: "corp".into(),
            socks_port: dead,
            command: None,
        }])
        .unwrap();
        let rule = RouteRule::parse("endsWith .corp via corp", &registry, Provenance::new("t", 1)).unwrap();
        let (mut client, session, handle) = start(context(vec![rule]), socks_spec()).await;

        let mut req = vec![5, 1, 0, 5, 1, 0, 3, 8];
        req.extend_from_slice(b"git.corp");
        req.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[5, 0]);
        assert_eq!(&buf[2..], &[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]);
        handle.await.unwrap();

        let snap = session.snapshot();
        assert_eq!(snap.state.status.code, StatusCode::ErrNetwork);
        assert!(snap.state.tunnel.is_none());
        assert!(snap.state.exited);
    }

    /// SOCKS5 relay for one connection: accepts, then drains until the proxy closes.
    async fn accepting_relay() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            s.read_exact(&mut greeting).await.unwrap();
            s.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            s.read_exact(&mut rest).await.unwrap();
            s.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0x04, 0xD2]).await.unwrap();
            let mut sink = Vec::new();
            let _ = s.read_to_end(&mut sink).await;
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_chained_count_released_when_client_vanishes() {
        let (port, relay) = accepting_relay().await;
        let registry = TunnelRegistry::from_specs(&[TunnelSpec {
            name: "corp".into(),
            socks_port: port,
            command: None,
        }])
        .unwrap();
        let corp = registry.lookup("corp").unwrap();
        let rule = RouteRule::parse("endsWith .corp via corp", &registry, Provenance::new("t", 1)).unwrap();
        let (mut client, session, handle) = start(context(vec![rule]), socks_spec()).await;

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        let mut req = vec![5, 1, 0, 3, 8];
        req.extend_from_slice(b"git.corp");
        req.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        drop(client);

        handle.await.unwrap();
        relay.await.unwrap();
        assert_eq!(corp.as_chained().unwrap().active_connections(), 0);
        assert!(session.snapshot().state.exited);
    }

    #[tokio::test]
    async fn test_garbage_handshake_marks_error() {
        let (mut client, session, handle) = start(context(vec![]), socks_spec()).await;
        client.write_all(&[0x47]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xFF]);
        handle.await.unwrap();
        assert_eq!(session.snapshot().state.status.code, StatusCode::Error);
    }
}
