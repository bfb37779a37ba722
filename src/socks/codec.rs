//! Server-side SOCKS4/SOCKS5 handshake parsing and reply encoding.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::address::AddressIdentity;
use crate::error::{ProxyError, Result};
use crate::session::Session;

use super::constants::*;

/// Read exactly `buf.len()` bytes; a short read means the client sent a truncated field.
async fn read_field<S>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ProxyError::protocol(format!("truncated {what}")))
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_byte<S>(stream: &mut S, what: &str) -> Result<u8>
where
    S: AsyncRead + Unpin,
{
    let mut b = [0u8; 1];
    read_field(stream, &mut b, what).await?;
    Ok(b[0])
}

async fn read_port<S>(stream: &mut S) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    let mut p = [0u8; 2];
    read_field(stream, &mut p, "port").await?;
    Ok(u16::from_be_bytes(p))
}

/// Parse a client handshake and populate the session's protocol fields.
///
/// On success the session carries the version, the command, the address type
/// and the destination, and `destination_original` is frozen. Failures that
/// happen after the command is known get a protocol-correct failure reply
/// before the error is returned. Earlier failures just close the connection.
pub async fn parse_handshake<S>(session: &Session, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = read_byte(stream, "version").await?;
    match version {
        SOCKS4_VERSION => parse_socks4(session, stream).await,
        SOCKS5_VERSION => parse_socks5(session, stream).await,
        other => {
            // Courtesy reply in v5 format; v4 clients have no equivalent.
            let _ = stream
                .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
                .await;
            Err(ProxyError::protocol(format!(
                "unsupported SOCKS version {other:#04x}"
            )))
        }
    }
}

async fn parse_socks4<S>(session: &Session, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cmd = read_byte(stream, "SOCKS4 command").await?;
    let port = read_port(stream).await?;
    let mut ip = [0u8; 4];
    read_field(stream, &mut ip, "SOCKS4 address").await?;
    drain_userid(stream).await?;

    let command = Command::from_byte(cmd);
    let destination = AddressIdentity::from_ipv4_octets(ip, port);
    trace!(?command, %destination, "parsed SOCKS4 request");

    {
        let mut st = session.lock();
        st.socks_version = Some(SocksVersion::V4);
        st.command = command;
        st.command_original = command;
        st.address_type = Some(AddressType::Ipv4);
        st.address_type_original = Some(AddressType::Ipv4);
        st.destination = destination.clone();
    }
    session.set_destination_original(destination);

    if command != Some(Command::Connect) {
        let _ = encode_failure(session, stream, ReplyCode::CommandNotSupported).await;
        return Err(ProxyError::protocol(format!(
            "SOCKS4 command {cmd:#04x} not supported"
        )));
    }
    Ok(())
}

/// Consume the NUL-terminated SOCKS4 user id without keeping it.
async fn drain_userid<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    for _ in 0..SOCKS4_MAX_USERID {
        if read_byte(stream, "SOCKS4 user id").await? == 0 {
            return Ok(());
        }
    }
    Err(ProxyError::protocol(format!(
        "SOCKS4 user id longer than {SOCKS4_MAX_USERID} bytes"
    )))
}

fn method_name(method: u8) -> &'static str {
    match method {
        AUTH_METHOD_GSSAPI => "GSSAPI",
        AUTH_METHOD_PASSWORD => "username/password",
        _ => "unknown",
    }
}

async fn parse_socks5<S>(session: &Session, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nmethods = read_byte(stream, "method count").await?;
    let mut methods = vec![0u8; nmethods as usize];
    read_field(stream, &mut methods, "method list").await?;
    trace!(?methods, "SOCKS5 offered methods");

    if !methods.contains(&AUTH_METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
            .await?;
        let offered: Vec<&str> = methods.iter().map(|m| method_name(*m)).collect();
        return Err(ProxyError::protocol(format!(
            "client requires authentication: {}",
            offered.join(", ")
        )));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;

    let mut header = [0u8; 4];
    read_field(stream, &mut header, "request header").await?;
    let [ver, cmd, _rsv, atyp] = header;
    if ver != SOCKS5_VERSION {
        return Err(ProxyError::protocol(format!(
            "request version {ver:#04x} after SOCKS5 negotiation"
        )));
    }

    let address_type = AddressType::from_byte(atyp)
        .ok_or_else(|| ProxyError::protocol(format!("unknown address type {atyp:#04x}")))?;

    let destination = match address_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            read_field(stream, &mut ip, "IPv4 address").await?;
            AddressIdentity::from_ipv4_octets(ip, read_port(stream).await?)
        }
        AddressType::Domain => {
            let len = read_byte(stream, "domain length").await?;
            if len == 0 {
                return Err(ProxyError::protocol("empty domain name"));
            }
            let mut name = vec![0u8; len as usize];
            read_field(stream, &mut name, "domain name").await?;
            let name = String::from_utf8(name)
                .map_err(|_| ProxyError::protocol("domain name is not valid UTF-8"))?;
            AddressIdentity::from_hostname(name, read_port(stream).await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            read_field(stream, &mut ip, "IPv6 address").await?;
            AddressIdentity::from_ipv6_octets(ip, read_port(stream).await?)
        }
    };

    let command = Command::from_byte(cmd);
    debug!(?command, ?address_type, %destination, "parsed SOCKS5 request");

    {
        let mut st = session.lock();
        st.socks_version = Some(SocksVersion::V5);
        st.command = command;
        st.command_original = command;
        st.address_type = Some(address_type);
        st.address_type_original = Some(address_type);
        st.destination = destination.clone();
    }
    session.set_destination_original(destination);

    if address_type == AddressType::Ipv6 {
        let _ = encode_failure(session, stream, ReplyCode::AddressTypeNotSupported).await;
        return Err(ProxyError::protocol("IPv6 destinations are not supported"));
    }
    if command != Some(Command::Connect) {
        let _ = encode_failure(session, stream, ReplyCode::CommandNotSupported).await;
        return Err(ProxyError::protocol(format!(
            "SOCKS5 command {cmd:#04x} not supported"
        )));
    }
    Ok(())
}

/// Write the reply for the session's protocol version.
///
/// SOCKS5 replies always carry an IPv4 address. When the client asked by
/// domain name the address and port are zeroed: some Java clients fail to
/// parse a domain-typed reply (JDK-8162760), so the name is never echoed.
pub async fn encode_reply<S>(
    session: &Session,
    stream: &mut S,
    reply: ReplyCode,
    bound: Option<SocketAddr>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (version, original_type) = {
        let st = session.lock();
        (st.socks_version, st.address_type_original)
    };

    let bytes: Vec<u8> = match version {
        Some(SocksVersion::V4) => {
            let code = if reply.is_success() {
                SOCKS4_GRANTED
            } else {
                SOCKS4_REJECTED
            };
            vec![0x00, code, 0, 0, 0, 0, 0, 0]
        }
        Some(SocksVersion::V5) => {
            let (ip, port) = match (original_type, bound) {
                (Some(AddressType::Domain), _) => ([0u8; 4], 0u16),
                (_, Some(SocketAddr::V4(v4))) => (v4.ip().octets(), v4.port()),
                _ => ([0u8; 4], 0u16),
            };
            let mut buf = Vec::with_capacity(10);
            buf.extend_from_slice(&[
                SOCKS5_VERSION,
                reply.as_byte(),
                0x00,
                AddressType::Ipv4.as_byte(),
            ]);
            buf.extend_from_slice(&ip);
            buf.extend_from_slice(&port.to_be_bytes());
            buf
        }
        None => {
            return Err(ProxyError::InternalConsistency(
                "reply requested before a SOCKS version was negotiated".into(),
            ))
        }
    };

    trace!(?reply, ?bytes, "writing SOCKS reply");
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn encode_failure<S>(session: &Session, stream: &mut S, reply: ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    encode_reply(session, stream, reply, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;
    use crate::service::Service;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn socks_session() -> Session {
        let spec = ServiceSpec::Socks {
            bind: "127.0.0.1".parse().unwrap(),
            port: 1080,
        };
        Session::new(Arc::new(Service::from_spec(1, &spec)), AddressIdentity::new())
    }

    #[tokio::test]
    async fn test_socks4_connect_parses_and_replies_granted() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[4, 1, 0, 80, 93, 184, 216, 34, 0])
            .await
            .unwrap();

        parse_handshake(&session, &mut server).await.unwrap();

        let snap = session.snapshot();
        assert_eq!(snap.state.socks_version, Some(SocksVersion::V4));
        assert_eq!(snap.state.command_original, Some(Command::Connect));
        assert_eq!(snap.state.destination.address, Some("93.184.216.34".parse().unwrap()));
        assert_eq!(snap.state.destination.port, 80);
        assert_eq!(snap.destination_original, Some(snap.state.destination.clone()));

        encode_reply(&session, &mut server, ReplyCode::Succeeded, None)
            .await
            .unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 0x5A, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_socks4_userid_is_drained() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        let mut req = vec![4, 1, 0x01, 0xBB, 10, 0, 0, 1];
        req.extend_from_slice(b"alice\0");
        client.write_all(&req).await.unwrap();

        parse_handshake(&session, &mut server).await.unwrap();
        assert_eq!(session.destination().port, 443);
    }

    #[tokio::test]
    async fn test_socks4_overlong_userid_rejected() {
        let session = socks_session();
        let (mut client, mut server) = duplex(4096);
        let mut req = vec![4, 1, 0, 80, 10, 0, 0, 1];
        req.extend(std::iter::repeat(b'x').take(SOCKS4_MAX_USERID + 1));
        client.write_all(&req).await.unwrap();

        let err = parse_handshake(&session, &mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_socks4_bind_rejected_with_reply() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client.write_all(&[4, 2, 0, 80, 10, 0, 0, 1, 0]).await.unwrap();

        assert!(parse_handshake(&session, &mut server).await.is_err());
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], SOCKS4_REJECTED);
    }

    #[tokio::test]
    async fn test_socks5_domain_request_gets_zero_ipv4_reply() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        let mut req = vec![5, 1, 0, 5, 1, 0, 3, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        parse_handshake(&session, &mut server).await.unwrap();

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let dest = session.destination();
        assert_eq!(dest.hostname.as_deref(), Some("example.com"));
        assert_eq!(dest.port, 443);

        let bound: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        encode_reply(&session, &mut server, ReplyCode::Succeeded, Some(bound))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_socks5_ipv4_request_echoes_bound_address() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[5, 1, 0, 5, 1, 0, 1, 10, 1, 2, 3, 0, 80])
            .await
            .unwrap();
        parse_handshake(&session, &mut server).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let bound: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        encode_reply(&session, &mut server, ReplyCode::Succeeded, Some(bound))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0, 0, 1, 192, 168, 1, 5, 0x9C, 0x40]);
    }

    #[tokio::test]
    async fn test_socks5_auth_required_is_rejected() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client.write_all(&[5, 2, 1, 2]).await.unwrap();

        let err = parse_handshake(&session, &mut server).await.unwrap_err();
        match err {
            ProxyError::Protocol(msg) => assert!(msg.ends_with("GSSAPI, username/password")),
            other => panic!("unexpected error: {other}"),
        }
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0xFF]);
    }

    #[tokio::test]
    async fn test_socks5_ipv6_rejected_after_parse() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        let mut req = vec![5, 1, 0, 5, 1, 0, 4];
        req.extend_from_slice(&[0u8; 15]);
        req.push(1);
        req.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        assert!(parse_handshake(&session, &mut server).await.is_err());
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[5, 0]);
        assert_eq!(buf[3], ReplyCode::AddressTypeNotSupported.as_byte());
        assert_eq!(session.destination().port, 22);
    }

    #[tokio::test]
    async fn test_socks5_udp_associate_not_supported() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[5, 1, 0, 5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        assert!(parse_handshake(&session, &mut server).await.is_err());
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[3], ReplyCode::CommandNotSupported.as_byte());
    }

    #[tokio::test]
    async fn test_unknown_version_gets_no_acceptable_methods() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        assert!(parse_handshake(&session, &mut server).await.is_err());
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xFF]);
    }

    #[tokio::test]
    async fn test_truncated_request_is_protocol_error() {
        let session = socks_session();
        let (mut client, mut server) = duplex(256);
        client.write_all(&[4, 1, 0]).await.unwrap();
        drop(client);

        let err = parse_handshake(&session, &mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }
}
