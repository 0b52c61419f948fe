use super::{ClientShared, DiversionLookup};
use crate::error::{Result, TunnelError};
use crate::forward::{forward_streams, ConnectionGuard};
use crate::io_util::reset_connection;
use crate::protocol::SessionHeader;
use quinn::VarInt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 非复用模式下等待服务端确认数据的时间
const SESSION_DRAIN: Duration = Duration::from_secs(3);

/// 选择会话头地址：导流查询优先，否则使用连接自身的对端和本地地址
fn session_header(
    peer: SocketAddr,
    local: SocketAddr,
    diversion: Option<&dyn DiversionLookup>,
) -> SessionHeader {
    match diversion.and_then(|lookup| lookup.original_addresses(peer, local)) {
        Some((source, destination)) => SessionHeader::new(source, destination),
        None => SessionHeader::new(peer, local),
    }
}

/// 处理一条被导流到本地的 TCP 连接
pub(crate) async fn handle_local_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    shared: Arc<ClientShared>,
) -> Result<()> {
    let local = tcp.local_addr()?;
    let header = session_header(peer, local, shared.diversion.as_deref());
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let mut tunnel = match shared.sessions.open_stream().await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("No tunnel stream for {}: {}", header, e);
            reset_connection(tcp);
            return Err(e);
        }
    };
    let stream_id = tunnel.id();
    let session_id = tunnel.session_id();

    let encoded = header.encode();
    match timeout(shared.connect_timeout, tunnel.send.write_all(&encoded)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = tunnel.send.reset(VarInt::from_u32(0));
            reset_connection(tcp);
            return Err(TunnelError::stream_unavailable(format!(
                "failed to send header on stream {}: {}",
                stream_id, e
            )));
        }
        Err(_) => {
            let _ = tunnel.send.reset(VarInt::from_u32(0));
            reset_connection(tcp);
            return Err(TunnelError::timeout(shared.connect_timeout));
        }
    }

    let host = header.destination.ip().to_string();
    let guard = ConnectionGuard::register(shared.stats.clone(), host, Some(peer.to_string()));

    info!(
        "Forwarding {} over stream {} of session {}",
        header, stream_id, session_id
    );
    let summary = forward_streams(
        tcp,
        &mut tunnel.send,
        &mut tunnel.recv,
        &guard,
        &shared.forward,
    )
    .await;
    info!(
        "Stream {} closed ({}): {} B down, {} B up",
        stream_id, header, summary.downloaded, summary.uploaded
    );

    if tunnel.owns_session() {
        let _ = timeout(SESSION_DRAIN, tunnel.send.stopped()).await;
        tunnel
            .connection()
            .close(VarInt::from_u32(0), b"stream finished");
        debug!("Session {} closed with its only stream", session_id);
    }
    Ok(())
}
