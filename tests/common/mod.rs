//! Common utilities for integration tests
#![allow(dead_code)]

use quic_pep::config::{ClientConfig, ServerConfig};
use quic_pep::{ClientTunnel, DiversionLookup, ServerTunnel, Statistics};
use rand::Rng;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Find a TCP port that nothing listens on
pub async fn closed_tcp_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    listener.local_addr().expect("Failed to get local addr")
}

/// Random payload of the given size
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::rng().fill(&mut payload[..]);
    payload
}

/// Echo server that mirrors bytes until the peer half-closes
pub async fn start_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Diversion lookup reporting the same original addresses for every connection
pub struct FixedDiversion {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl DiversionLookup for FixedDiversion {
    fn original_addresses(
        &self,
        _peer: SocketAddr,
        _local: SocketAddr,
    ) -> Option<(SocketAddr, SocketAddr)> {
        Some((self.source, self.destination))
    }
}

/// Report fixed original addresses for every diverted connection
pub fn divert(source: SocketAddr, destination: SocketAddr) -> Option<Arc<dyn DiversionLookup>> {
    let lookup: Arc<dyn DiversionLookup> = Arc::new(FixedDiversion {
        source,
        destination,
    });
    Some(lookup)
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        connection_timeout_secs: 5,
        ..Default::default()
    }
}

pub fn client_config(gateway: SocketAddr) -> ClientConfig {
    ClientConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        gateway_host: gateway.ip().to_string(),
        gateway_port: gateway.port(),
        connect_timeout_secs: 5,
        ..Default::default()
    }
}

pub struct RunningServer {
    pub tunnel: Arc<ServerTunnel>,
    pub stats: Arc<Statistics>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<quic_pep::Result<()>>,
}

pub async fn start_server(config: ServerConfig) -> RunningServer {
    let stats = Arc::new(Statistics::new());
    let tunnel = Arc::new(ServerTunnel::new(config, stats.clone()));
    let addr = tunnel.bind().expect("Failed to bind QUIC server");
    let handle = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.run().await })
    };
    RunningServer {
        tunnel,
        stats,
        addr,
        handle,
    }
}

pub struct RunningClient {
    pub tunnel: Arc<ClientTunnel>,
    pub stats: Arc<Statistics>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<quic_pep::Result<()>>,
}

pub async fn start_client(
    config: ClientConfig,
    diversion: Option<Arc<dyn DiversionLookup>>,
) -> RunningClient {
    let stats = Arc::new(Statistics::new());
    let mut tunnel = ClientTunnel::new(config, stats.clone()).expect("Failed to create client");
    if let Some(lookup) = diversion {
        tunnel = tunnel.with_diversion(lookup);
    }
    let tunnel = Arc::new(tunnel);
    let listener = tunnel.bind().await.expect("Failed to bind client listener");
    let addr = listener.local_addr().expect("Failed to get client addr");
    let handle = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.serve(listener).await })
    };
    RunningClient {
        tunnel,
        stats,
        addr,
        handle,
    }
}

/// Send a payload through the client and read the echo back
pub async fn echo_through(client: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(client)
        .await
        .expect("Failed to connect to client tunnel");
    stream.write_all(payload).await.expect("Failed to write payload");
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echoed))
        .await
        .expect("Timed out waiting for echo")
        .expect("Failed to read echo");
    echoed
}

/// Poll a condition until it holds or the timeout expires
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll an async condition until it holds or the timeout expires
pub async fn wait_until_async<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Read until EOF or error, returning whether the peer closed within the limit
pub async fn closed_within(stream: &mut TcpStream, limit: Duration) -> bool {
    let mut buf = [0u8; 64];
    let result = tokio::time::timeout(limit, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    result.is_ok()
}
