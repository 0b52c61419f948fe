use crate::error::{Result, TunnelError};
use crate::forward::{forward_streams, ConnectionGuard, ForwardOptions};
use crate::protocol::SessionHeader;
use crate::stats::Statistics;
use quinn::{RecvStream, SendStream, VarInt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// 所有流共享的处理参数
pub(crate) struct StreamContext {
    pub stats: Arc<Statistics>,
    /// 读取会话头和拨号目标的超时
    pub connection_timeout: Duration,
    pub forward: ForwardOptions,
}

/// 只终止这一条流，会话不受影响
fn abort_stream(send: &mut SendStream, recv: &mut RecvStream) {
    let _ = send.reset(VarInt::from_u32(0));
    let _ = recv.stop(VarInt::from_u32(0));
}

/// 处理一条入站 QUIC 流：解析会话头、拨号目标、双向转发
pub(crate) async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    ctx: Arc<StreamContext>,
) -> Result<()> {
    let stream_id = recv.id();

    let header = match timeout(ctx.connection_timeout, SessionHeader::read_from(&mut recv)).await {
        Ok(Ok(header)) => header,
        Ok(Err(e)) => {
            abort_stream(&mut send, &mut recv);
            return Err(e);
        }
        Err(_) => {
            abort_stream(&mut send, &mut recv);
            return Err(TunnelError::timeout(ctx.connection_timeout));
        }
    };
    debug!("Stream {} header: {}", stream_id, header);

    let tcp = match timeout(ctx.connection_timeout, TcpStream::connect(header.destination)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            abort_stream(&mut send, &mut recv);
            return Err(TunnelError::connection_failed(
                header.destination.to_string(),
                e,
            ));
        }
        Err(_) => {
            abort_stream(&mut send, &mut recv);
            return Err(TunnelError::timeout(ctx.connection_timeout));
        }
    };
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY towards {}: {}", header.destination, e);
    }

    let host = header.source.ip().to_string();
    let mapping_key = tcp.local_addr().ok().map(|addr| addr.to_string());
    let guard = ConnectionGuard::register(ctx.stats.clone(), host, mapping_key);

    info!("Forwarding {} over stream {}", header, stream_id);
    let summary = forward_streams(tcp, &mut send, &mut recv, &guard, &ctx.forward).await;
    info!(
        "Stream {} closed ({}): {} B down, {} B up",
        stream_id, header, summary.downloaded, summary.uploaded
    );
    Ok(())
}
