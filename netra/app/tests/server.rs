//! Pipe-engine tests: real loopback sockets end to end, with the
//! packet-filter lookup replaced by a fixed original destination.

use netra_app::{App, Config};
use netra_proxy_transport::{FixedOrigDstAddr, OrigDstAddr, TransportError};
use opentelemetry_sdk::trace::TracerProvider;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// An orig-dst lookup that always fails, as on a non-diverted socket.
#[derive(Clone)]
struct NoOrigDst;

impl OrigDstAddr for NoOrigDst {
    fn orig_dst_addr(&self, _: &TcpStream) -> Result<SocketAddr, TransportError> {
        Err(TransportError::Resolve(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "connection was not redirected",
        )))
    }
}

fn config_with_http_port(port: u16) -> Config {
    let mut config = Config::default();
    config.proxy_port = 0;
    config.http_ports = vec![port].into_iter().collect();
    config
}

async fn start<G: OrigDstAddr>(config: Config, orig_dst: G) -> SocketAddr {
    let provider = TracerProvider::builder().build();
    let app = App::bind(config, &provider, orig_dst).await.expect("bind");
    let addr = app.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = app.run().await;
    });
    addr
}

#[tokio::test]
async fn raw_tcp_flows_are_forwarded_to_the_original_destination() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let orig_dst = upstream.local_addr().unwrap();

    // The destination port is not in the HTTP set, so this flow is raw TCP.
    let mut config = Config::default();
    config.proxy_port = 0;
    config.http_ports = vec![].into_iter().collect();
    let proxy = start(config, FixedOrigDstAddr(orig_dst)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"\x05\x01\x00 not http at all").await.unwrap();
    client.shutdown().await.unwrap();

    let (mut server, _) = upstream.accept().await.unwrap();
    let mut got = Vec::new();
    server.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, b"\x05\x01\x00 not http at all");

    server.write_all(b"raw reply").await.unwrap();
    drop(server);
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"raw reply");
}

#[tokio::test]
async fn http_classified_flows_gain_a_request_id() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let orig_dst = upstream.local_addr().unwrap();

    let proxy = start(
        config_with_http_port(orig_dst.port()),
        FixedOrigDstAddr(orig_dst),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    let (mut server, _) = upstream.accept().await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert!(server.read(&mut byte).await.unwrap() != 0, "eof in head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("GET /ping HTTP/1.1\r\n"));
    assert!(
        head.to_ascii_lowercase().contains("x-request-id: "),
        "missing request id in {:?}",
        head
    );

    server
        .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
        .await
        .unwrap();
    let mut rsp = vec![0u8; 4];
    client.read_exact(&mut rsp).await.unwrap();
    assert_eq!(&rsp, b"HTTP");
}

#[tokio::test]
async fn unresolvable_connections_are_dropped() {
    let mut config = Config::default();
    config.proxy_port = 0;
    let proxy = start(config, NoOrigDst).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // The proxy closes without reading anything.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn dial_failures_close_the_downstream() {
    // Nothing listens on the original destination.
    let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let proxy = start(
        config_with_http_port(unreachable.port()),
        FixedOrigDstAddr(unreachable),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn accept_loop_survives_individual_connections() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let orig_dst = upstream.local_addr().unwrap();
    let mut config = Config::default();
    config.proxy_port = 0;
    config.http_ports = vec![].into_iter().collect();
    let proxy = start(config, FixedOrigDstAddr(orig_dst)).await;

    for round in 0..3 {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        let msg = format!("round {}", round);
        client.write_all(msg.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let (mut server, _) = upstream.accept().await.unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, msg.as_bytes());
    }
}
