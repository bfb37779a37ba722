use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::address::AddressIdentity;
use crate::config::ServiceSpec;
use crate::handler::{handle_connection, ProxyContext};
use crate::service::Service;
use crate::session::Session;
use crate::status::build_document;

const HOUSEKEEPING_TICK: Duration = Duration::from_millis(250);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Every live or recently finished session of a proxy.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.write().push(session);
    }

    /// Cheap copy of the list; callers iterate without holding the registry lock.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Answer every outstanding status request with one shared document.
    pub fn service_status_requests(&self) {
        let sessions = self.sessions();
        if !sessions.iter().any(|s| s.wants_status()) {
            return;
        }
        match build_document(&sessions) {
            Ok(doc) => {
                for session in sessions.iter().filter(|s| s.wants_status()) {
                    session.fulfil_status(doc.clone());
                }
            }
            Err(e) => error!("failed to build status document: {}", e),
        }
    }

    /// Drop sessions whose handler exited at least `loiter` ago.
    pub fn reap(&self, loiter: Duration) -> usize {
        let now = SystemTime::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| {
            let st = s.lock();
            match (st.exited, st.end_time) {
                (true, Some(end)) => now.duration_since(end).map_or(true, |age| age < loiter),
                _ => true,
            }
        });
        before - sessions.len()
    }
}

/// Bound listeners for all configured services.
pub struct Server {
    ctx: Arc<ProxyContext>,
    listeners: Vec<(Arc<Service>, TcpListener)>,
    sessions: Arc<SessionRegistry>,
    loiter: Duration,
}

impl Server {
    /// Bind every service in order; service ids start at 1.
    pub async fn bind(
        ctx: Arc<ProxyContext>,
        services: &[ServiceSpec],
        sessions: Arc<SessionRegistry>,
        loiter: Duration,
    ) -> io::Result<Self> {
        let mut listeners = Vec::with_capacity(services.len());
        for (i, spec) in services.iter().enumerate() {
            let mut service = Service::from_spec(i as u32 + 1, spec);
            let listener = TcpListener::bind(service.bind).await.map_err(|e| {
                io::Error::new(e.kind(), format!("cannot bind {}: {}", service.bind, e))
            })?;
            // Port 0 binds are resolved to the real port for logging and status.
            service.bind = listener.local_addr()?;
            info!(service = %service, "listening");
            listeners.push((Arc::new(service), listener));
        }
        Ok(Self {
            ctx,
            listeners,
            sessions,
            loiter,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|(s, _)| s.bind).collect()
    }

    /// Accept forever on every listener, with periodic housekeeping.
    pub async fn run(self) {
        for (service, listener) in self.listeners {
            let span = info_span!("service", name = %service);
            let ctx = Arc::clone(&self.ctx);
            let sessions = Arc::clone(&self.sessions);
            tokio::spawn(accept_loop(ctx, service, listener, sessions).instrument(span));
        }

        let mut tick = tokio::time::interval(HOUSEKEEPING_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if self.sessions.is_empty() {
                continue;
            }
            self.sessions.service_status_requests();
            let reaped = self.sessions.reap(self.loiter);
            if reaped > 0 {
                debug!(reaped, remaining = self.sessions.len(), "reaped sessions");
            }
        }
    }
}

async fn accept_loop(
    ctx: Arc<ProxyContext>,
    service: Arc<Service>,
    listener: TcpListener,
    sessions: Arc<SessionRegistry>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually descriptor exhaustion; give handlers a moment to finish.
                warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let session = Arc::new(Session::new(
            Arc::clone(&service),
            AddressIdentity::from_socket_addr(peer),
        ));
        sessions.insert(Arc::clone(&session));

        let span = info_span!("session", id = session.id());
        span.in_scope(|| debug!(%peer, "accepted"));
        tokio::spawn(handle_connection(Arc::clone(&ctx), session, stream).instrument(span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{RetryPolicy, TunnelConnector};
    use crate::dns_resolver::SystemResolver;
    use crate::rules::RouteRuleEngine;
    use crate::session::StatusCode;
    use crate::shuttle::Shuttle;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn context() -> Arc<ProxyContext> {
        let resolver = Arc::new(SystemResolver::default());
        Arc::new(ProxyContext {
            engine: RouteRuleEngine::new(Vec::new(), resolver.clone()),
            connector: TunnelConnector::new(RetryPolicy::default(), resolver),
            shuttle: Shuttle::default(),
            handshake_timeout: Duration::from_secs(5),
        })
    }

    fn session() -> Arc<Session> {
        let spec = ServiceSpec::Socks {
            bind: "127.0.0.1".parse().unwrap(),
            port: 1080,
        };
        Arc::new(Session::new(
            Arc::new(Service::from_spec(1, &spec)),
            AddressIdentity::new(),
        ))
    }

    #[test]
    fn test_reap_keeps_live_and_loitering_sessions() {
        let registry = SessionRegistry::default();
        let live = session();
        let done = session();
        registry.insert(live.clone());
        registry.insert(done.clone());
        done.mark_exited();

        assert_eq!(registry.reap(Duration::from_secs(60)), 0);
        assert_eq!(registry.reap(Duration::ZERO), 1);
        let left = registry.sessions();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), live.id());
    }

    #[test]
    fn test_status_requests_share_one_document() {
        let registry = SessionRegistry::default();
        let a = session();
        let b = session();
        registry.insert(a.clone());
        registry.insert(b.clone());

        registry.service_status_requests();
        assert_eq!(a.take_status(), None);

        a.request_status();
        b.request_status();
        registry.service_status_requests();
        let doc_a = a.take_status().unwrap();
        let doc_b = b.take_status().unwrap();
        assert_eq!(doc_a, doc_b);

        let rows: serde_json::Value = serde_json::from_str(&doc_a).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_socks5_through_server() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let registry = Arc::new(SessionRegistry::default());
        let services = vec![ServiceSpec::Socks {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
        }];
        let server = Server::bind(context(), &services, registry.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let addr = server.local_addrs()[0];
        assert_ne!(addr.port(), 0);
        let running = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let mut req = vec![5, 1, 0, 1, 127, 0, 0, 1];
        req.extend_from_slice(&echo_port.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[5, 0, 0, 1]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(registry.len(), 1);
        let session = registry.sessions().remove(0);
        assert_eq!(session.snapshot().state.status.code, StatusCode::Okay);

        running.abort();
    }
}
