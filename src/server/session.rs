use super::connection::{handle_stream, StreamContext};
use crate::error::TunnelError;
use quinn::{Connection, ConnectionError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 会话正常结束（空闲超时或任一方有序关闭），不作为错误记录
pub(crate) fn is_benign_close(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::TimedOut
            | ConnectionError::ApplicationClosed(_)
            | ConnectionError::LocallyClosed
    )
}

/// 在一个会话上循环接受流，直到会话结束
pub(crate) async fn run_session(connection: Connection, ctx: Arc<StreamContext>) {
    let remote = connection.remote_address();
    let session_id = connection.stable_id();
    info!("QUIC session {} accepted from {}", session_id, remote);

    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, ctx).await {
                        log_stream_error(&e);
                    }
                });
            }
            Err(e) if is_benign_close(&e) => {
                debug!("QUIC session {} from {} ended: {}", session_id, remote, e);
                break;
            }
            Err(e) => {
                warn!("QUIC session {} from {} failed: {}", session_id, remote, e);
                break;
            }
        }
    }
}

fn log_stream_error(err: &TunnelError) {
    match err {
        TunnelError::MalformedHeader(_) => warn!("Dropping stream: {}", err),
        TunnelError::ConnectionFailed { .. } | TunnelError::Timeout { .. } => {
            info!("Stream aborted: {}", err)
        }
        _ => warn!("Stream error: {}", err),
    }
}
