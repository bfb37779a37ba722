use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::RelaySettings;
use crate::error::Result;
use crate::session::Session;

const DEFAULT_BUFFER_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuttleExit {
    /// Both directions finished
    Closed,
    /// Nothing was read within the idle timeout
    IdleTimeout,
}

enum Event {
    FromClient(io::Result<usize>),
    FromUpstream(io::Result<usize>),
}

fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Write failed because the peer is gone, not because something is broken.
fn is_closed(e: &io::Error) -> bool {
    is_reset(e) || matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected)
}

/// Relays bytes between a client and its upstream.
pub struct Shuttle {
    buffer_size: usize,
    idle_timeout: Option<Duration>,
}

impl Default for Shuttle {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

impl From<&RelaySettings> for Shuttle {
    fn from(s: &RelaySettings) -> Self {
        Self {
            buffer_size: s.buffer_size.max(1),
            idle_timeout: s.idle_timeout(),
        }
    }
}

impl Shuttle {
    #[cfg(test)]
    fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    /// Relay until neither side can produce more data.
    ///
    /// Without an upstream (null tunnel) the client's bytes are read,
    /// counted as rx, and thrown away.
    ///
    /// EOF on one side only stops reading that side and forwards the
    /// half-close to the other; the opposite direction keeps flowing.
    pub async fn run<C, U>(
        &self,
        session: &Session,
        client: &mut C,
        upstream: Option<&mut U>,
    ) -> Result<ShuttleExit>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        match upstream {
            None => self.sink(session, client).await,
            Some(upstream) => self.relay(session, client, upstream).await,
        }
    }

    async fn sink<C>(&self, session: &Session, client: &mut C) -> Result<ShuttleExit>
    where
        C: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let read = match self.idle_timeout {
                Some(idle) => match timeout(idle, client.read(&mut buf)).await {
                    Ok(r) => r,
                    Err(_) => return Ok(ShuttleExit::IdleTimeout),
                },
                None => client.read(&mut buf).await,
            };
            match read {
                Ok(0) => return Ok(ShuttleExit::Closed),
                Ok(n) => {
                    trace!(n, "discarded");
                    session.add_rx(n);
                }
                Err(e) if is_reset(&e) => return Ok(ShuttleExit::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn relay<C, U>(&self, session: &Session, client: &mut C, upstream: &mut U) -> Result<ShuttleExit>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let mut client_buf = vec![0u8; self.buffer_size];
        let mut upstream_buf = vec![0u8; self.buffer_size];

        let mut client_readable = true;
        let mut client_writable = true;
        let mut upstream_readable = true;
        let mut upstream_writable = true;

        while client_readable || upstream_readable {
            let next = async {
                tokio::select! {
                    r = client_read.read(&mut client_buf), if client_readable => Event::FromClient(r),
                    r = upstream_read.read(&mut upstream_buf), if upstream_readable => Event::FromUpstream(r),
                }
            };
            let event = match self.idle_timeout {
                Some(idle) => match timeout(idle, next).await {
                    Ok(event) => event,
                    Err(_) => {
                        debug!("relay idle, closing");
                        return Ok(ShuttleExit::IdleTimeout);
                    }
                },
                None => next.await,
            };

            match event {
                Event::FromClient(Ok(0)) => {
                    trace!("client half-closed");
                    client_readable = false;
                    if upstream_writable {
                        let _ = upstream_write.shutdown().await;
                        upstream_writable = false;
                    }
                }
                Event::FromClient(Ok(n)) => {
                    if !upstream_writable {
                        trace!(n, "upstream closed, draining client bytes");
                        continue;
                    }
                    match upstream_write.write_all(&client_buf[..n]).await {
                        Ok(()) => session.add_tx(n),
                        Err(e) if is_closed(&e) => upstream_writable = false,
                        Err(e) => return Err(e.into()),
                    }
                }
                Event::FromClient(Err(e)) if is_reset(&e) => {
                    debug!("client reset");
                    client_readable = false;
                    client_writable = false;
                }
                Event::FromClient(Err(e)) => return Err(e.into()),

                Event::FromUpstream(Ok(0)) => {
                    trace!("upstream half-closed");
                    upstream_readable = false;
                    if client_writable {
                        let _ = client_write.shutdown().await;
                        client_writable = false;
                    }
                }
                Event::FromUpstream(Ok(n)) => {
                    if !client_writable {
                        trace!(n, "client closed, draining upstream bytes");
                        continue;
                    }
                    match client_write.write_all(&upstream_buf[..n]).await {
                        Ok(()) => session.add_rx(n),
                        Err(e) if is_closed(&e) => client_writable = false,
                        Err(e) => return Err(e.into()),
                    }
                }
                Event::FromUpstream(Err(e)) if is_reset(&e) => {
                    debug!("upstream reset");
                    upstream_readable = false;
                    upstream_writable = false;
                }
                Event::FromUpstream(Err(e)) => return Err(e.into()),
            }

            // A side that can neither be read nor written leaves nothing to relay.
            if (!client_readable && !client_writable) || (!upstream_readable && !upstream_writable) {
                break;
            }
        }
        Ok(ShuttleExit::Closed)
    }
}
