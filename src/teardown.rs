use std::net::Shutdown;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Shut a socket down in both directions, drain anything still readable,
/// then close it. Closing with unread data in the receive buffer would make
/// the kernel answer with RST instead of FIN.
pub async fn safe_close(mut stream: TcpStream) {
    if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
        trace!("shutdown before close: {}", e);
    }

    let mut buf = [0u8; 4096];
    let drained = timeout(DRAIN_TIMEOUT, async {
        let mut total = 0usize;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break total,
                Ok(n) => total += n,
            }
        }
    })
    .await;
    if let Ok(n) = drained {
        if n > 0 {
            trace!(n, "drained before close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_peer_sees_clean_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        let (ours, _) = listener.accept().await.unwrap();

        peer.write_all(b"unread bytes").await.unwrap();
        safe_close(ours).await;

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
