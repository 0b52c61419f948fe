/// End-to-end tests: client tunnel and server tunnel on loopback
mod common;

use quic_pep::config::ClientConfig;
use quic_pep::stats::{PERF_CONN, PERF_DW_COUNT, PERF_UP_COUNT, TOTAL_CONNECTIONS};
use quic_pep::{HandlerStatus, TunnelHandler};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const WAIT: Duration = Duration::from_secs(10);

fn fake_source() -> SocketAddr {
    "10.1.2.3:40000".parse().unwrap()
}

/// 会话头携带的源地址被服务端用于统计，双向各 1 KiB
#[tokio::test]
async fn test_header_addresses_and_byte_counters() {
    let (echo_addr, _echo) = common::start_echo_server().await;
    let server = common::start_server(common::server_config()).await;
    let diversion = common::divert(fake_source(), echo_addr);
    let client = common::start_client(common::client_config(server.addr), diversion).await;

    let payload = common::random_payload(1024);
    let echoed = common::echo_through(client.addr, &payload).await;
    assert_eq!(echoed, payload);

    let server_stats = server.stats.clone();
    assert!(
        common::wait_until(WAIT, || {
            server_stats.get(PERF_DW_COUNT, &["10.1.2.3"]) == Some(1024.0)
                && server_stats.get(PERF_UP_COUNT, &["10.1.2.3"]) == Some(1024.0)
        })
        .await,
        "server counters: {:?}",
        server.stats.snapshot()
    );

    let echo_host = echo_addr.ip().to_string();
    let client_stats = client.stats.clone();
    assert!(
        common::wait_until(WAIT, || {
            client_stats.get(PERF_UP_COUNT, &[echo_host.as_str()]) == Some(1024.0)
                && client_stats.get(PERF_DW_COUNT, &[echo_host.as_str()]) == Some(1024.0)
        })
        .await,
        "client counters: {:?}",
        client.stats.snapshot()
    );

    // 连接结束后连接计数回落
    assert!(
        common::wait_until(WAIT, || {
            server_stats.get(TOTAL_CONNECTIONS, &[]) == Some(0.0)
                && server_stats.get(PERF_CONN, &["10.1.2.3"]) == Some(0.0)
        })
        .await
    );
}

/// 复用模式下顺序连接共用一个会话
#[tokio::test]
async fn test_multi_stream_reuses_session() {
    let (echo_addr, _echo) = common::start_echo_server().await;
    let server = common::start_server(common::server_config()).await;
    let diversion = common::divert(fake_source(), echo_addr);
    let client = common::start_client(common::client_config(server.addr), diversion).await;

    for size in [16usize, 4096, 100_000] {
        let payload = common::random_payload(size);
        assert_eq!(common::echo_through(client.addr, &payload).await, payload);
    }
    assert_eq!(client.tunnel.dial_attempts(), 1);

    let first = client.tunnel.open_stream().await.unwrap();
    let second = client.tunnel.open_stream().await.unwrap();
    assert_eq!(first.session_id(), second.session_id());
    assert_ne!(first.id(), second.id());
    assert!(!first.owns_session());
    assert_eq!(client.tunnel.dial_attempts(), 1);
}

/// 当前会话的流额度耗尽时立即改用新会话，而不是等待额度
#[tokio::test]
async fn test_exhausted_stream_credit_dials_new_session() {
    let mut server_config = common::server_config();
    server_config.quic.max_incoming_streams = 1;
    let server = common::start_server(server_config).await;
    let (echo_addr, _echo) = common::start_echo_server().await;
    let diversion = common::divert(fake_source(), echo_addr);
    let client = common::start_client(common::client_config(server.addr), diversion).await;

    let first = client.tunnel.open_stream().await.unwrap();
    assert_eq!(client.tunnel.dial_attempts(), 1);

    let second = tokio::time::timeout(Duration::from_secs(5), client.tunnel.open_stream())
        .await
        .expect("open_stream waited for stream credit")
        .unwrap();
    assert_eq!(client.tunnel.dial_attempts(), 2);
    assert_ne!(first.session_id(), second.session_id());
    assert!(!second.owns_session());
}

/// 关闭复用后每条连接单独建立会话
#[tokio::test]
async fn test_single_stream_mode_dials_per_connection() {
    let (echo_addr, _echo) = common::start_echo_server().await;
    let server = common::start_server(common::server_config()).await;
    let diversion = common::divert(fake_source(), echo_addr);
    let config = ClientConfig {
        multi_stream: false,
        ..common::client_config(server.addr)
    };
    let client = common::start_client(config, diversion).await;

    let payload = common::random_payload(2048);
    assert_eq!(common::echo_through(client.addr, &payload).await, payload);
    assert_eq!(common::echo_through(client.addr, &payload).await, payload);
    assert_eq!(client.tunnel.dial_attempts(), 2);

    let stream = client.tunnel.open_stream().await.unwrap();
    assert!(stream.owns_session());
    assert_eq!(client.tunnel.dial_attempts(), 3);
}

/// 目标拒绝连接：流被关闭，字节计数不变，连接计数回到原值
#[tokio::test]
async fn test_refused_destination_closes_connection() {
    let refused = common::closed_tcp_port().await;
    let server = common::start_server(common::server_config()).await;
    let diversion = common::divert(fake_source(), refused);
    let client = common::start_client(common::client_config(server.addr), diversion).await;

    let mut stream = TcpStream::connect(client.addr).await.unwrap();
    let app_addr = stream.local_addr().unwrap();
    let _ = stream.write_all(b"hello?").await;
    assert!(common::closed_within(&mut stream, WAIT).await);
    drop(stream);

    assert_eq!(server.stats.get(PERF_UP_COUNT, &["10.1.2.3"]), None);
    assert_eq!(server.stats.get(PERF_DW_COUNT, &["10.1.2.3"]), None);
    assert!(matches!(
        server.stats.get(TOTAL_CONNECTIONS, &[]),
        None | Some(0.0)
    ));

    let client_stats = client.stats.clone();
    assert!(
        common::wait_until(WAIT, || {
            matches!(client_stats.get(TOTAL_CONNECTIONS, &[]), None | Some(0.0))
        })
        .await
    );
    assert!(client.stats.get_mapped_address(&app_addr.to_string()).is_none());
}

/// 网关无响应：按次数重试后放弃，本地连接被关闭
#[tokio::test]
async fn test_dead_gateway_exhausts_retries() {
    // 绑定但从不应答的 UDP 端口
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let gateway = silent.local_addr().unwrap();
    let (echo_addr, _echo) = common::start_echo_server().await;
    let diversion = common::divert(fake_source(), echo_addr);
    let config = ClientConfig {
        connect_timeout_secs: 1,
        connection_retries: 3,
        ..common::client_config(gateway)
    };
    let client = common::start_client(config, diversion).await;

    let mut stream = TcpStream::connect(client.addr).await.unwrap();
    assert!(common::closed_within(&mut stream, Duration::from_secs(15)).await);

    assert_eq!(client.tunnel.dial_attempts(), 3);
    assert_eq!(client.stats.get(TOTAL_CONNECTIONS, &[]), None);
    assert!(client.stats.hosts().is_empty());

    let err = match client.tunnel.open_stream().await {
        Ok(_) => panic!("dead gateway yielded a stream"),
        Err(e) => e,
    };
    assert!(err.is_session_unavailable());
    assert_eq!(client.tunnel.dial_attempts(), 6);
}

/// 停止后释放监听端口
#[tokio::test]
async fn test_shutdown_releases_ports() {
    let (echo_addr, _echo) = common::start_echo_server().await;
    let server = common::start_server(common::server_config()).await;
    let diversion = common::divert(fake_source(), echo_addr);
    let client = common::start_client(common::client_config(server.addr), diversion).await;

    let payload = common::random_payload(512);
    assert_eq!(common::echo_through(client.addr, &payload).await, payload);

    client.tunnel.stop().await.unwrap();
    tokio::time::timeout(WAIT, client.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(client.tunnel.status(), HandlerStatus::Stopped);

    server.tunnel.stop().await.unwrap();
    tokio::time::timeout(WAIT, server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.tunnel.status(), HandlerStatus::Stopped);

    let client_addr = client.addr;
    assert!(
        common::wait_until_async(WAIT, || async move {
            TcpListener::bind(client_addr).await.is_ok()
        })
        .await
    );
    let server_addr = server.addr;
    assert!(
        common::wait_until_async(WAIT, || async move {
            UdpSocket::bind(server_addr).await.is_ok()
        })
        .await
    );
}
