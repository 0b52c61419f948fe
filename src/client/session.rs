use crate::config::ClientConfig;
use crate::error::{Result, TunnelError};
use crate::tls::SERVER_NAME;
use crate::transport::create_client_endpoint;
use anyhow::Context;
use parking_lot::Mutex;
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream, StreamId, VarInt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 在 QUIC 会话上打开的一条双向流
pub struct TunnelStream {
    pub send: SendStream,
    pub recv: RecvStream,
    connection: Connection,
    owns_session: bool,
}

impl TunnelStream {
    /// 流标识
    pub fn id(&self) -> StreamId {
        self.send.id()
    }

    /// 所属会话的标识
    pub fn session_id(&self) -> usize {
        self.connection.stable_id()
    }

    /// 非复用模式下该流独占会话，流结束后需关闭会话
    pub fn owns_session(&self) -> bool {
        self.owns_session
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// QUIC 会话管理
///
/// 复用模式下保存当前会话；复用失败时仅在缓存仍指向同一会话时才清除，
/// 并发连接同时重拨属于良性竞争，后写入者胜出。
pub(crate) struct SessionManager {
    endpoint: Endpoint,
    gateway: String,
    multi_stream: bool,
    retries: u32,
    connect_timeout: Duration,
    current: Mutex<Option<Connection>>,
    dial_attempts: AtomicU64,
}

impl SessionManager {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let bind: SocketAddr = match config.gateway_host.parse::<std::net::IpAddr>() {
            Ok(ip) if ip.is_ipv6() => "[::]:0",
            _ => "0.0.0.0:0",
        }
        .parse()
        .map_err(|e| TunnelError::config_error(format!("client bind address: {}", e)))?;
        let endpoint = create_client_endpoint(bind, &config.quic)?;

        Ok(Self {
            endpoint,
            gateway: config.gateway(),
            multi_stream: config.multi_stream,
            retries: config.connection_retries.max(1),
            connect_timeout: config.connect_timeout(),
            current: Mutex::new(None),
            dial_attempts: AtomicU64::new(0),
        })
    }

    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::Relaxed)
    }

    /// 获取一条新流：优先复用当前会话，否则重新建立会话
    pub async fn open_stream(&self) -> Result<TunnelStream> {
        if self.multi_stream {
            let cached = self.current.lock().clone();
            if let Some(connection) = cached {
                if connection.close_reason().is_none() {
                    match try_open_bi(&connection).await {
                        Some(Ok((send, recv))) => {
                            return Ok(TunnelStream {
                                send,
                                recv,
                                connection,
                                owns_session: false,
                            })
                        }
                        Some(Err(e)) => debug!(
                            "Cannot open stream on session {}: {}, dialing a new session",
                            connection.stable_id(),
                            e
                        ),
                        None => debug!(
                            "Session {} has no stream credit left, dialing a new session",
                            connection.stable_id()
                        ),
                    }
                }
                self.discard(&connection);
            }
        }

        let connection = self.dial().await?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TunnelError::stream_unavailable(e.to_string()))?;

        if self.multi_stream {
            *self.current.lock() = Some(connection.clone());
        }
        Ok(TunnelStream {
            send,
            recv,
            connection,
            owns_session: !self.multi_stream,
        })
    }

    /// 仅当缓存仍指向失效会话时清除
    fn discard(&self, stale: &Connection) {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .is_some_and(|c| c.stable_id() == stale.stable_id())
        {
            *current = None;
        }
    }

    /// 按重试次数建立新会话
    async fn dial(&self) -> Result<Connection> {
        let mut last_error = String::new();

        for attempt in 1..=self.retries {
            self.dial_attempts.fetch_add(1, Ordering::Relaxed);
            match self.try_dial().await {
                Ok(connection) => {
                    info!(
                        "QUIC session {} established to {} (attempt {}/{})",
                        connection.stable_id(),
                        self.gateway,
                        attempt,
                        self.retries
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(
                        "QUIC dial to {} failed (attempt {}/{}): {:#}",
                        self.gateway, attempt, self.retries, e
                    );
                    last_error = format!("{:#}", e);
                }
            }
        }

        error!(
            "Giving up on {} after {} attempt(s)",
            self.gateway, self.retries
        );
        Err(TunnelError::session_unavailable(
            self.gateway.clone(),
            self.retries,
            last_error,
        ))
    }

    async fn try_dial(&self) -> anyhow::Result<Connection> {
        let addr = self.resolve_gateway().await?;
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .context("Failed to start QUIC handshake")?;
        let connection = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out after {:?}", self.connect_timeout))?
            .context("QUIC handshake failed")?;
        Ok(connection)
    }

    async fn resolve_gateway(&self) -> anyhow::Result<SocketAddr> {
        let want_v6 = self.endpoint.local_addr()?.is_ipv6();
        let mut candidates = tokio::net::lookup_host(self.gateway.as_str())
            .await
            .with_context(|| format!("Failed to resolve gateway {}", self.gateway))?;
        candidates
            .find(|addr| addr.is_ipv6() == want_v6)
            .with_context(|| format!("No usable address for gateway {}", self.gateway))
    }

    /// 关闭当前会话与端点
    pub fn close(&self) {
        if let Some(connection) = self.current.lock().take() {
            connection.close(VarInt::from_u32(0), b"client shutdown");
        }
        self.endpoint.close(VarInt::from_u32(0), b"client shutdown");
    }

    pub async fn wait_idle(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("QUIC client sessions still draining after {:?}", grace);
        }
    }
}

/// 不等待流额度地尝试打开一条流，额度耗尽时返回 `None`
async fn try_open_bi(
    connection: &Connection,
) -> Option<std::result::Result<(SendStream, RecvStream), ConnectionError>> {
    tokio::select! {
        biased;
        opened = connection.open_bi() => Some(opened),
        _ = std::future::ready(()) => None,
    }
}
