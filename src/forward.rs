/// TCP 连接与 QUIC 流之间的双向转发
///
/// 客户端和服务端使用同一套转发逻辑：QUIC→TCP 计入下行计数，TCP→QUIC 计入上行计数。
use crate::config::BufferConfig;
use crate::io_util::{close_with_linger, copy_adaptive, AdaptiveWindow, DEFAULT_LINGER};
use crate::stats::{Statistics, PERF_CONN, PERF_DW_COUNT, PERF_UP_COUNT, TOTAL_CONNECTIONS};
use quinn::{RecvStream, SendStream, VarInt};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 单条转发的参数
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    pub window: AdaptiveWindow,
    /// 每次读写的超时，`None` 表示不限制
    pub io_timeout: Option<Duration>,
    pub linger: Duration,
}

impl ForwardOptions {
    pub fn new(buffer: &BufferConfig, io_timeout: Option<Duration>) -> Self {
        Self {
            window: AdaptiveWindow::new(buffer.initial_size, buffer.max_size),
            io_timeout,
            linger: DEFAULT_LINGER,
        }
    }
}

/// 连接统计守卫
///
/// 创建时登记连接数与地址映射，Drop 时撤销，保证任何退出路径（包括 panic）都会释放。
pub struct ConnectionGuard {
    stats: Arc<Statistics>,
    host: String,
    mapping_key: Option<String>,
    mapping_released: AtomicBool,
}

impl ConnectionGuard {
    pub fn register(
        stats: Arc<Statistics>,
        host: impl Into<String>,
        mapping_key: Option<String>,
    ) -> Self {
        let host = host.into();
        stats.increment(TOTAL_CONNECTIONS, &[]);
        stats.increment(PERF_CONN, &[host.as_str()]);
        if let Some(key) = &mapping_key {
            stats.set_mapped_address(key, &host);
        }
        Self {
            stats,
            host,
            mapping_key,
            mapping_released: AtomicBool::new(false),
        }
    }

    /// 被跟踪的主机
    pub fn host(&self) -> &str {
        &self.host
    }

    fn add_bytes(&self, prefix: &str, bytes: usize) {
        self.stats.add_bytes(prefix, &self.host, bytes as u64);
    }

    /// 删除地址映射，只生效一次
    pub fn release_mapping(&self) {
        if self.mapping_released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(key) = &self.mapping_key {
            self.stats.delete_mapped_address(key);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release_mapping();
        self.stats.decrement(PERF_CONN, &[self.host.as_str()]);
        self.stats.decrement(TOTAL_CONNECTIONS, &[]);
        self.stats.retire_host(&self.host);
    }
}

/// 单条转发的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    /// QUIC→TCP 字节数
    pub downloaded: u64,
    /// TCP→QUIC 字节数
    pub uploaded: u64,
}

/// 双向转发直到两个方向都结束
///
/// 任一方向读到 0 字节或出错即结束该方向：QUIC→TCP 结束后半关闭 TCP 写端并删除地址映射，
/// TCP→QUIC 结束后 finish 发送流。两个方向汇合后停止接收流，TCP 以 linger 方式关闭。
pub async fn forward_streams(
    mut tcp: TcpStream,
    send: &mut SendStream,
    recv: &mut RecvStream,
    guard: &ConnectionGuard,
    options: &ForwardOptions,
) -> ForwardSummary {
    let (down, up) = {
        let (mut tcp_read, mut tcp_write) = tcp.split();

        let downstream = async {
            let result = copy_adaptive(
                &mut *recv,
                &mut tcp_write,
                options.window,
                options.io_timeout,
                |n| guard.add_bytes(PERF_DW_COUNT, n),
            )
            .await;
            guard.release_mapping();
            let _ = tcp_write.shutdown().await;
            result
        };

        let upstream = async {
            let result = copy_adaptive(
                &mut tcp_read,
                &mut *send,
                options.window,
                options.io_timeout,
                |n| guard.add_bytes(PERF_UP_COUNT, n),
            )
            .await;
            let _ = send.finish();
            result
        };

        tokio::join!(downstream, upstream)
    };

    let _ = recv.stop(VarInt::from_u32(0));
    close_with_linger(tcp, options.linger);

    ForwardSummary {
        downloaded: settle("QUIC->TCP", guard.host(), down),
        uploaded: settle("TCP->QUIC", guard.host(), up),
    }
}

fn settle(direction: &str, host: &str, result: io::Result<u64>) -> u64 {
    match result {
        Ok(bytes) => bytes,
        Err(e) if is_disconnect(&e) => {
            debug!("{} for {} ended: {}", direction, host, e);
            0
        }
        Err(e) => {
            warn!("{} for {} failed: {}", direction, host, e);
            0
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
