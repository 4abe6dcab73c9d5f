use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hickory_resolver::proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_resolver::proto::rr::rdata::A;
use hickory_resolver::proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use geoforward::app::server::DnsServer;
use geoforward::config::parse_config;
use geoforward::forward::Forwarder;
use geoforward::router::provider::{ScopeSource, SharedScope};

/// 简单的 UDP 上游：对任意 A 查询回答固定地址
async fn spawn_upstream(answer: Ipv4Addr) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut reply = Message::from_vec(&buf[..n]).unwrap();
            reply.set_message_type(MessageType::Response);
            let q = reply.queries()[0].clone();
            if q.query_type() == RecordType::A {
                reply.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(answer))));
            }
            let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
        }
    });
    addr
}

async fn ask(server: std::net::SocketAddr, name: &str, id: u16) -> Message {
    let mut query = Message::new();
    query
        .set_id(id)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query.to_vec().unwrap(), server).await.unwrap();
    let mut buf = [0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::from_vec(&buf[..n]).unwrap()
}

#[tokio::test]
async fn forwards_over_udp_from_config() {
    let u0 = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4)).await;
    let block = spawn_upstream(Ipv4Addr::new(0, 0, 0, 0)).await;

    let dir = tempfile::tempdir().unwrap();
    let scope_file = dir.path().join("scope.txt");
    std::fs::write(&scope_file, "# managed\nexample.com\n").unwrap();

    let yaml = format!(
        r#"
forwards:
  - name: main
    from: ["{scope}"]
    default: U0
    policy: sequential
    upstreams:
      - name: U0
        to: ["udp://{u0}"]
      - name: block
        to: ["{block}"]
    rules:
      - pattern: "suffix:ads.example.com."
        upstream: block
"#,
        scope = scope_file.display(),
        u0 = u0,
        block = block
    );
    let config = parse_config(&yaml).unwrap();
    let forward = &config.forwards[0];

    let source = ScopeSource::new(forward.from.clone());
    let scope: SharedScope = Arc::new(ArcSwap::from_pointee(source.build().unwrap()));
    let forwarder = Arc::new(Forwarder::from_config(forward, scope).unwrap());

    let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), forwarder)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));

    let reply = ask(addr, "www.example.com.", 100).await;
    assert_eq!(reply.id(), 100);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::new(1, 2, 3, 4))))
    );

    let reply = ask(addr, "ads.example.com.", 101).await;
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::new(0, 0, 0, 0))))
    );

    // 范围外且没有下一个处理器
    let reply = ask(addr, "www.example.org.", 102).await;
    assert_eq!(reply.id(), 102);
    assert_eq!(reply.response_code(), ResponseCode::ServFail);

    cancel.cancel();
}
