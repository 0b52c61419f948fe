mod connection;
mod session;

use crate::config::ServerConfig;
use crate::error::{Result, TunnelError};
use crate::forward::ForwardOptions;
use crate::handler::{HandlerStatus, TunnelHandler};
use crate::stats::Statistics;
use crate::tls::TlsIdentity;
use crate::transport::create_server_endpoint;
use async_trait::async_trait;
use connection::StreamContext;
use parking_lot::{Mutex, RwLock};
use quinn::{Endpoint, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 关闭时等待会话优雅结束的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// 服务端隧道（网关）
///
/// 接受 QUIC 会话，每个会话在独立任务中循环接受流；每条流解析会话头后拨号真实目标并转发。
pub struct ServerTunnel {
    config: ServerConfig,
    stats: Arc<Statistics>,
    endpoint: Mutex<Option<Endpoint>>,
    shutdown: CancellationToken,
    status: RwLock<HandlerStatus>,
}

impl ServerTunnel {
    pub fn new(config: ServerConfig, stats: Arc<Statistics>) -> Self {
        Self::with_shutdown(config, stats, CancellationToken::new())
    }

    /// 使用外部关闭令牌（通常是进程级令牌的子令牌）
    pub fn with_shutdown(
        config: ServerConfig,
        stats: Arc<Statistics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            stats,
            endpoint: Mutex::new(None),
            shutdown,
            status: RwLock::new(HandlerStatus::Stopped),
        }
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 绑定 QUIC 端点，重复调用返回已绑定的地址
    pub fn bind(&self) -> Result<SocketAddr> {
        let mut slot = self.endpoint.lock();
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.local_addr()?);
        }

        let addr = self.config.listen_addr()?;
        let identity = TlsIdentity::load_or_generate(
            self.config.cert_path.as_deref(),
            self.config.key_path.as_deref(),
        )
        .map_err(TunnelError::tls)?;
        let endpoint = create_server_endpoint(addr, identity, &self.config.quic)?;
        let local = endpoint.local_addr()?;
        *slot = Some(endpoint);
        Ok(local)
    }

    /// 已绑定的本地地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
    }

    fn set_status(&self, status: HandlerStatus) {
        *self.status.write() = status;
    }

    fn stream_context(&self) -> Arc<StreamContext> {
        Arc::new(StreamContext {
            stats: self.stats.clone(),
            connection_timeout: self.config.connection_timeout(),
            forward: ForwardOptions::new(&self.config.buffer, self.config.io_timeout()),
        })
    }

    /// 运行接受循环直到关闭
    pub async fn run(&self) -> Result<()> {
        self.set_status(HandlerStatus::Starting);
        let local = match self.bind() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to start QUIC server: {}", e);
                self.set_status(HandlerStatus::Failed(e.to_string()));
                return Err(e);
            }
        };
        let endpoint = match self.endpoint.lock().clone() {
            Some(endpoint) => endpoint,
            None => return Err(TunnelError::bind_failed(local.to_string(), "endpoint released")),
        };

        let ctx = self.stream_context();
        self.set_status(HandlerStatus::Running);
        info!("QUIC server listening on {}", local);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping QUIC server");
                    break;
                }
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        debug!("QUIC endpoint closed");
                        break;
                    };
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        match incoming.await {
                            Ok(connection) => session::run_session(connection, ctx).await,
                            Err(e) => debug!("QUIC handshake failed: {}", e),
                        }
                    });
                }
            }
        }

        self.close_endpoint().await;
        self.set_status(HandlerStatus::Stopped);
        Ok(())
    }

    async fn close_endpoint(&self) {
        let endpoint = self.endpoint.lock().take();
        if let Some(endpoint) = endpoint {
            endpoint.close(VarInt::from_u32(0), b"server shutdown");
            if tokio::time::timeout(SHUTDOWN_GRACE, endpoint.wait_idle())
                .await
                .is_err()
            {
                debug!("QUIC sessions still draining after {:?}", SHUTDOWN_GRACE);
            }
        }
    }
}

#[async_trait]
impl TunnelHandler for ServerTunnel {
    async fn start(&self) -> Result<()> {
        self.run().await
    }

    async fn stop(&self) -> Result<()> {
        self.set_status(HandlerStatus::Stopping);
        self.shutdown.cancel();
        Ok(())
    }

    fn status(&self) -> HandlerStatus {
        self.status.read().clone()
    }

    fn name(&self) -> &str {
        "server"
    }
}
