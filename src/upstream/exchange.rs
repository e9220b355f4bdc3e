//! Per-protocol upstream exchanges
//!
//! One function per wire protocol, each taking a query message and
//! returning the parsed reply. Deadlines are applied by the caller; every
//! exchange validates that the reply matches the query (ID and question)
//! before handing it back.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::Message;
use reqwest::header;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Receive buffer for UDP replies (EDNS0-sized).
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Maximum framed message size over TCP and TLS.
const MAX_STREAM_MESSAGE_SIZE: usize = 65535;

/// Wire format for DoH requests and responses (RFC 8484).
const DOH_CONTENT_TYPE: &str = "application/dns-message";

pub(crate) fn encode(message: &Message) -> Result<Vec<u8>> {
    message.to_vec().map_err(Error::encode)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Message> {
    Message::from_vec(bytes).map_err(Error::decode)
}

/// Check that a reply answers this query: matching ID and an identical
/// first question.
pub(crate) fn validate_reply(query: &Message, reply: &Message) -> bool {
    if query.id() != reply.id() {
        return false;
    }
    match (query.queries().first(), reply.queries().first()) {
        (Some(q), Some(r)) => {
            q.name() == r.name()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        // A reply without a question section cannot be matched up.
        _ => false,
    }
}

async fn resolve_target(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?
        .next()
        .ok_or_else(|| Error::upstream_transport(addr, "no address for endpoint"))
}

/// Plain UDP exchange (RFC 1035).
pub(crate) async fn udp_exchange(addr: &str, query: &Message) -> Result<Message> {
    let payload = encode(query)?;
    let server = resolve_target(addr).await?;

    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;

    socket
        .send_to(&payload, server)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;

    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    let (len, src) = socket
        .recv_from(&mut buf)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;
    if src != server {
        return Err(Error::upstream_transport(
            addr,
            format!("reply from unexpected source {src}"),
        ));
    }

    let reply = decode(&buf[..len])?;
    if !validate_reply(query, &reply) {
        return Err(Error::upstream_transport(addr, "reply does not match query"));
    }
    Ok(reply)
}

/// Plain TCP exchange with 2-byte length framing (RFC 1035).
pub(crate) async fn tcp_exchange(addr: &str, query: &Message) -> Result<Message> {
    let payload = encode(query)?;
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;
    stream.set_nodelay(true).ok();

    framed_exchange(&mut stream, addr, query, &payload).await
}

/// DNS-over-TLS exchange (RFC 7858): TCP + TLS, same framing as TCP.
pub(crate) async fn dot_exchange(
    addr: &str,
    connector: &TlsConnector,
    query: &Message,
) -> Result<Message> {
    let payload = encode(query)?;

    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    let server_name: ServerName<'static> = match host.parse::<IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(host.to_string())
            .map_err(|_| Error::upstream_transport(addr, "invalid TLS server name"))?,
    };

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;
    tcp.set_nodelay(true).ok();

    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::upstream_transport(addr, format!("TLS handshake failed: {e}")))?;

    framed_exchange(&mut tls, addr, query, &payload).await
}

/// DNS-over-HTTPS exchange (RFC 8484): POST the packed query, accept only
/// a 200 response carrying `application/dns-message`.
pub(crate) async fn doh_exchange(
    client: &reqwest::Client,
    url: &str,
    query: &Message,
) -> Result<Message> {
    let payload = encode(query)?;

    let response = client
        .post(url)
        .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
        .header(header::ACCEPT, DOH_CONTENT_TYPE)
        .body(payload)
        .send()
        .await
        .map_err(|e| Error::upstream_transport(url, e))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(Error::upstream_transport(url, format!("HTTP {status}")));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.contains(DOH_CONTENT_TYPE) {
        return Err(Error::upstream_transport(
            url,
            format!("unexpected content type: {content_type}"),
        ));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::upstream_transport(url, e))?;

    let reply = decode(&body)?;
    if !validate_reply(query, &reply) {
        return Err(Error::upstream_transport(url, "reply does not match query"));
    }
    Ok(reply)
}

/// Write a length-prefixed query and read back one length-prefixed reply.
async fn framed_exchange<S>(
    stream: &mut S,
    addr: &str,
    query: &Message,
    payload: &[u8],
) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_framed(stream, addr, payload).await?;
    let reply_bytes = read_framed(stream, addr).await?;

    let reply = decode(&reply_bytes)?;
    if !validate_reply(query, &reply) {
        return Err(Error::upstream_transport(addr, "reply does not match query"));
    }
    Ok(reply)
}

async fn write_framed<S>(stream: &mut S, addr: &str, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_STREAM_MESSAGE_SIZE {
        return Err(Error::encode(format!(
            "message too large for stream transport: {} bytes",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let prefix = (payload.len() as u16).to_be_bytes();
    stream
        .write_all(&prefix)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::upstream_transport(addr, e))
}

async fn read_framed<S>(stream: &mut S, addr: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;

    let len = u16::from_be_bytes(prefix) as usize;
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::upstream_transport(addr, e))?;
    Ok(body)
}

/// Build the TLS connector shared by every DoT probe.
pub(crate) fn tls_connector() -> TlsConnector {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("ring provider supports the default protocol versions")
    .with_root_certificates(root_store)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(domain: &str, id: u16) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message.set_recursion_desired(true);
        let name = Name::from_str(domain).unwrap();
        message.add_query(Query::query(name, RecordType::A));
        message
    }

    fn reply_for(request: &Message) -> Message {
        let mut reply = request.clone();
        reply.set_message_type(MessageType::Response);
        reply
    }

    // ========================================================================
    // Reply Validation Tests
    // ========================================================================

    #[test]
    fn test_validate_reply_matching() {
        let q = query("example.com.", 0x1234);
        let r = reply_for(&q);
        assert!(validate_reply(&q, &r));
    }

    #[test]
    fn test_validate_reply_id_mismatch() {
        let q = query("example.com.", 0x1234);
        let mut r = reply_for(&q);
        r.set_id(0x5678);
        assert!(!validate_reply(&q, &r));
    }

    #[test]
    fn test_validate_reply_question_mismatch() {
        let q = query("example.com.", 0x1234);
        let r = reply_for(&query("other.com.", 0x1234));
        assert!(!validate_reply(&q, &r));
    }

    #[test]
    fn test_validate_reply_no_question() {
        let q = query("example.com.", 0x1234);
        let mut r = Message::new();
        r.set_id(0x1234);
        assert!(!validate_reply(&q, &r));
    }

    // ========================================================================
    // Codec Tests
    // ========================================================================

    #[test]
    fn test_encode_decode_round_trip() {
        let q = query("example.com.", 0x4242);
        let bytes = encode(&q).unwrap();
        let parsed = decode(&bytes).unwrap();
        assert_eq!(parsed.id(), 0x4242);
        assert_eq!(parsed.queries().len(), 1);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(&[0xFF; 3]).is_err());
    }

    // ========================================================================
    // UDP Exchange Tests
    // ========================================================================

    #[tokio::test]
    async fn test_udp_exchange_against_mock() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let reply = reply_for(&request);
            server.send_to(&reply.to_vec().unwrap(), src).await.unwrap();
        });

        let q = query("example.com.", 0x1001);
        let reply = udp_exchange(&addr.to_string(), &q).await.unwrap();
        assert_eq!(reply.id(), 0x1001);
    }

    // ========================================================================
    // TCP Exchange Tests
    // ========================================================================

    #[tokio::test]
    async fn test_tcp_exchange_against_mock() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 2];
            stream.read_exact(&mut prefix).await.unwrap();
            let len = u16::from_be_bytes(prefix) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();

            let request = Message::from_vec(&body).unwrap();
            let reply = reply_for(&request).to_vec().unwrap();
            #[allow(clippy::cast_possible_truncation)]
            let out_prefix = (reply.len() as u16).to_be_bytes();
            stream.write_all(&out_prefix).await.unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let q = query("example.com.", 0x2002);
        let reply = tcp_exchange(&addr.to_string(), &q).await.unwrap();
        assert_eq!(reply.id(), 0x2002);
    }

    #[tokio::test]
    async fn test_tcp_exchange_connection_refused() {
        let q = query("example.com.", 0x3003);
        let result = tcp_exchange("127.0.0.1:1", &q).await;
        assert!(matches!(result, Err(Error::UpstreamTransport { .. })));
    }
}
