use anyhow::Result;
use std::path::PathBuf;

use crate::transport::CongestionControl;

use super::{validator::ConfigValidator, BufferConfig, ClientConfig, QuicConfig, ServerConfig};

/// ServerConfig Builder
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// 创建新的 Builder（以默认配置为起点）
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.config.listen_host = host.into();
        self
    }

    /// 设置监听端口
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.listen_port = port;
        self
    }

    /// 设置连接超时（秒）
    pub fn connection_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connection_timeout_secs = secs;
        self
    }

    /// 设置转发读写超时（秒），0 表示不限制
    pub fn io_timeout_secs(mut self, secs: u64) -> Self {
        self.config.io_timeout_secs = Some(secs);
        self
    }

    /// 设置性能采样间隔（毫秒）
    pub fn performance_interval_ms(mut self, ms: u64) -> Self {
        self.config.performance_interval_ms = ms;
        self
    }

    /// 设置证书路径
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cert_path = Some(path.into());
        self
    }

    /// 设置私钥路径
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.key_path = Some(path.into());
        self
    }

    /// 设置 QUIC 传输参数
    pub fn quic(mut self, quic: QuicConfig) -> Self {
        self.config.quic = quic;
        self
    }

    /// 设置拥塞控制算法
    pub fn congestion(mut self, congestion: CongestionControl) -> Self {
        self.config.quic.congestion = congestion;
        self
    }

    /// 设置读窗口参数
    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.config.buffer = buffer;
        self
    }

    /// 构建 ServerConfig 并验证
    pub fn build(self) -> Result<ServerConfig> {
        ConfigValidator::validate_server_config(&self.config)?;
        Ok(self.config)
    }
}

/// ClientConfig Builder
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// 创建新的 Builder（以默认配置为起点）
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置本地监听地址
    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.config.listen_host = host.into();
        self
    }

    /// 设置本地监听端口
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.listen_port = port;
        self
    }

    /// 设置网关地址
    pub fn gateway_host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway_host = host.into();
        self
    }

    /// 设置网关端口
    pub fn gateway_port(mut self, port: u16) -> Self {
        self.config.gateway_port = port;
        self
    }

    /// 设置是否复用 QUIC 会话
    pub fn multi_stream(mut self, enabled: bool) -> Self {
        self.config.multi_stream = enabled;
        self
    }

    /// 设置建立会话的尝试次数
    pub fn connection_retries(mut self, retries: u32) -> Self {
        self.config.connection_retries = retries;
        self
    }

    /// 设置单次建立会话的超时（秒）
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    /// 设置性能采样间隔（毫秒）
    pub fn performance_interval_ms(mut self, ms: u64) -> Self {
        self.config.performance_interval_ms = ms;
        self
    }

    /// 设置 QUIC 传输参数
    pub fn quic(mut self, quic: QuicConfig) -> Self {
        self.config.quic = quic;
        self
    }

    /// 设置读窗口参数
    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.config.buffer = buffer;
        self
    }

    /// 构建 ClientConfig 并验证
    pub fn build(self) -> Result<ClientConfig> {
        ConfigValidator::validate_client_config(&self.config)?;
        Ok(self.config)
    }
}
