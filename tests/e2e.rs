//! End-to-end proxy tests
//!
//! A real server bound on loopback, a real racing resolver, and a mock
//! upstream nameserver; queries travel the full UDP and TCP paths.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use sinkhole::cache::AnswerCache;
use sinkhole::config::RejectConfig;
use sinkhole::server::{QueryEngine, Server};
use sinkhole::store::{DomainStore, MemDomainStore};
use sinkhole::upstream::RacingResolver;

const UPSTREAM_ANSWER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

/// Mock upstream answering every A query with a fixed address.
async fn spawn_mock_upstream() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            let mut reply = request.clone();
            reply.set_message_type(MessageType::Response);
            reply.set_response_code(ResponseCode::NoError);
            if let Some(question) = request.queries().first() {
                reply.add_answer(Record::from_rdata(
                    question.name().clone(),
                    300,
                    RData::A(A(UPSTREAM_ANSWER)),
                ));
            }
            let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
        }
    });

    addr.to_string()
}

/// Bind a proxy wired to the mock upstream, with `ads.example` and
/// `*.tracker.example` blacklisted and `good.ads.example` whitelisted.
async fn spawn_proxy() -> Arc<Server> {
    let upstream = spawn_mock_upstream().await;

    let resolver = Arc::new(
        RacingResolver::new(
            &[upstream],
            Duration::from_millis(200),
            Duration::from_secs(2),
            reqwest::Client::new(),
        )
        .unwrap(),
    );

    let blacklist = Arc::new(MemDomainStore::new());
    blacklist.put("ads.example", true).unwrap();
    blacklist.put("*.tracker.example", true).unwrap();
    blacklist.put("good.ads.example", true).unwrap();

    let whitelist = Arc::new(MemDomainStore::with_entries(["good.ads.example"]).unwrap());

    let cache = Arc::new(AnswerCache::new(
        Duration::from_secs(600),
        Duration::from_secs(60),
    ));

    let engine = Arc::new(QueryEngine::new(
        resolver,
        blacklist,
        whitelist,
        cache,
        RejectConfig::default(),
    ));

    let server = Arc::new(
        Server::bind("127.0.0.1:0".parse().unwrap(), engine)
            .await
            .unwrap(),
    );
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });

    // Give the listeners a beat to start.
    tokio::time::sleep(Duration::from_millis(20)).await;
    server
}

fn build_query(domain: &str, qtype: RecordType, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    let name = Name::from_str(domain).unwrap();
    message.add_query(Query::query(name, qtype));
    message.to_vec().unwrap()
}

async fn udp_query(server: &Server, payload: &[u8]) -> Message {
    let addr = server.local_udp_addr().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(payload, addr).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

async fn tcp_query(server: &Server, payload: &[u8]) -> Message {
    let addr = server.local_tcp_addr().unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let prefix = u16::try_from(payload.len()).unwrap().to_be_bytes();
    stream.write_all(&prefix).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut prefix = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut prefix))
        .await
        .expect("reply within deadline")
        .unwrap();
    let len = u16::from_be_bytes(prefix) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    Message::from_vec(&body).unwrap()
}

// ============================================================================
// UDP Path
// ============================================================================

#[tokio::test]
async fn udp_blacklisted_query_is_sinkholed() {
    let server = spawn_proxy().await;

    let reply = udp_query(&server, &build_query("ads.example.", RecordType::A, 0x1234)).await;

    assert_eq!(reply.id(), 0x1234);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(reply.answers().len(), 1);
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::UNSPECIFIED)))
    );
    assert_eq!(reply.answers()[0].ttl(), 3600);

    server.shutdown();
}

#[tokio::test]
async fn udp_clean_query_is_forwarded() {
    let server = spawn_proxy().await;

    let reply = udp_query(&server, &build_query("clean.example.", RecordType::A, 0x4321)).await;

    assert_eq!(reply.id(), 0x4321);
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(UPSTREAM_ANSWER)))
    );

    server.shutdown();
}

#[tokio::test]
async fn udp_glob_entry_blocks_subdomains_only() {
    let server = spawn_proxy().await;

    let blocked = udp_query(
        &server,
        &build_query("pix.tracker.example.", RecordType::A, 1),
    )
    .await;
    assert_eq!(
        blocked.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::UNSPECIFIED)))
    );

    let parent = udp_query(&server, &build_query("tracker.example.", RecordType::A, 2)).await;
    assert_eq!(
        parent.answers()[0].data(),
        Some(&RData::A(A(UPSTREAM_ANSWER)))
    );

    server.shutdown();
}

#[tokio::test]
async fn udp_whitelist_overrides_blacklist() {
    let server = spawn_proxy().await;

    let reply = udp_query(
        &server,
        &build_query("good.ads.example.", RecordType::A, 7),
    )
    .await;
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(UPSTREAM_ANSWER)))
    );

    server.shutdown();
}

#[tokio::test]
async fn udp_repeat_query_keeps_its_own_id() {
    let server = spawn_proxy().await;

    let first = udp_query(&server, &build_query("cached.example.", RecordType::A, 0x0A0A)).await;
    let second = udp_query(&server, &build_query("cached.example.", RecordType::A, 0x0B0B)).await;

    assert_eq!(first.id(), 0x0A0A);
    assert_eq!(second.id(), 0x0B0B);
    assert_eq!(first.answers()[0].data(), second.answers()[0].data());
    assert_eq!(server.engine().stats().cache_hits(), 1);

    server.shutdown();
}

// ============================================================================
// TCP Path
// ============================================================================

#[tokio::test]
async fn tcp_queries_travel_the_same_pipeline() {
    let server = spawn_proxy().await;

    let blocked = tcp_query(&server, &build_query("ads.example.", RecordType::A, 0x0C0C)).await;
    assert_eq!(blocked.id(), 0x0C0C);
    assert_eq!(
        blocked.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::UNSPECIFIED)))
    );

    let forwarded =
        tcp_query(&server, &build_query("clean.example.", RecordType::A, 0x0D0D)).await;
    assert_eq!(
        forwarded.answers()[0].data(),
        Some(&RData::A(A(UPSTREAM_ANSWER)))
    );

    server.shutdown();
}
