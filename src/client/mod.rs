mod session;
mod stream;

pub use session::TunnelStream;

use crate::config::ClientConfig;
use crate::error::{Result, TunnelError};
use crate::forward::ForwardOptions;
use crate::handler::{HandlerStatus, TunnelHandler};
use crate::stats::Statistics;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use session::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 关闭时等待会话优雅结束的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// 被导流连接的原始地址查询
///
/// 透明代理场景下，本地接受的连接的对端地址和本地地址即为原始的源地址和目标地址；
/// 其它导流方式（如 NAT 表查询）可以通过实现该 trait 提供真实地址。
pub trait DiversionLookup: Send + Sync {
    /// 返回 `(源地址, 目标地址)`，`None` 表示使用连接自身的地址
    fn original_addresses(
        &self,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Option<(SocketAddr, SocketAddr)>;
}

/// 所有本地连接共享的状态
pub(crate) struct ClientShared {
    pub stats: Arc<Statistics>,
    pub sessions: SessionManager,
    pub diversion: Option<Arc<dyn DiversionLookup>>,
    pub forward: ForwardOptions,
    pub connect_timeout: Duration,
}

/// 客户端隧道
///
/// 在本地接受被导流的 TCP 连接，每条连接在 QUIC 会话上打开一条流，
/// 先写入会话头，再双向转发数据。
pub struct ClientTunnel {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    status: RwLock<HandlerStatus>,
}

impl ClientTunnel {
    /// 创建客户端，同时创建 QUIC 客户端端点
    pub fn new(config: ClientConfig, stats: Arc<Statistics>) -> Result<Self> {
        let sessions = SessionManager::new(&config)?;
        let shared = ClientShared {
            stats,
            sessions,
            diversion: None,
            forward: ForwardOptions::new(&config.buffer, None),
            connect_timeout: config.connect_timeout(),
        };
        Ok(Self {
            config,
            shared: Arc::new(shared),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            status: RwLock::new(HandlerStatus::Stopped),
        })
    }

    /// 设置原始地址查询，需在启动前调用
    pub fn with_diversion(mut self, lookup: Arc<dyn DiversionLookup>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.diversion = Some(lookup),
            None => debug!("Client already serving, diversion lookup ignored"),
        }
        self
    }

    /// 使用外部关闭令牌
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.shared.stats
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 正在监听的本地地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// 至今为止发起的 QUIC 拨号次数（含失败）
    pub fn dial_attempts(&self) -> u64 {
        self.shared.sessions.dial_attempts()
    }

    /// 直接获取一条隧道流
    pub async fn open_stream(&self) -> Result<TunnelStream> {
        self.shared.sessions.open_stream().await
    }

    fn set_status(&self, status: HandlerStatus) {
        *self.status.write() = status;
    }

    /// 绑定配置中的本地地址
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self
            .config
            .listen_addr()
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::bind_failed(addr.to_string(), e))
    }

    /// 在给定的监听器上运行接受循环直到关闭
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        self.set_status(HandlerStatus::Running);
        info!(
            "Client listening on {}, tunneling to {}",
            local,
            self.config.gateway()
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping client");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                let result =
                                    stream::handle_local_connection(tcp, peer, shared).await;
                                if let Err(e) = result {
                                    debug!("Connection from {} ended with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept local connection: {}", e),
                    }
                }
            }
        }

        drop(listener);
        *self.local_addr.lock() = None;
        self.shared.sessions.close();
        self.shared.sessions.wait_idle(SHUTDOWN_GRACE).await;
        self.set_status(HandlerStatus::Stopped);
        Ok(())
    }

    /// 绑定并运行
    pub async fn run(&self) -> Result<()> {
        self.set_status(HandlerStatus::Starting);
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start client: {}", e);
                self.set_status(HandlerStatus::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.serve(listener).await
    }
}

#[async_trait]
impl TunnelHandler for ClientTunnel {
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
        "client"
    }
}
