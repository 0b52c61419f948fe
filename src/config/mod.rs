// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::{ClientConfigBuilder, ServerConfigBuilder};
pub use validator::ConfigValidator;

use crate::transport::CongestionControl;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    443
}

fn default_client_port() -> u16 {
    9443
}

fn default_gateway_host() -> String {
    "198.18.0.254".to_string()
}

fn default_connection_timeout_secs() -> u64 {
    10
}

fn default_connection_retries() -> u32 {
    3
}

fn default_multi_stream() -> bool {
    true
}

fn default_performance_interval_ms() -> u64 {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_incoming_streams() -> u32 {
    40_000
}

fn default_initial_buffer_size() -> usize {
    4096
}

fn default_max_buffer_size() -> usize {
    1024 * 1024
}

/// QUIC 传输参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuicConfig {
    /// 会话空闲超时（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 保活间隔（秒），不设置则不发送保活包
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,
    /// 每个会话允许对端打开的双向流数量
    #[serde(default = "default_max_incoming_streams")]
    pub max_incoming_streams: u32,
    /// 拥塞控制算法
    #[serde(default)]
    pub congestion: CongestionControl,
    /// 初始拥塞窗口（以数据包计）
    #[serde(default)]
    pub initial_congestion_window_packets: Option<u32>,
    /// 触发 ACK 的包数阈值（ACK 抽稀）
    #[serde(default)]
    pub ack_eliciting_threshold: Option<u32>,
    /// 请求对端使用的最大 ACK 延迟（毫秒）
    #[serde(default)]
    pub max_ack_delay_ms: Option<u64>,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            keep_alive_secs: None,
            max_incoming_streams: default_max_incoming_streams(),
            congestion: CongestionControl::default(),
            initial_congestion_window_packets: None,
            ack_eliciting_threshold: None,
            max_ack_delay_ms: None,
        }
    }
}

impl QuicConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_secs.map(Duration::from_secs)
    }
}

/// 自适应读窗口参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// 初始读取大小
    #[serde(default = "default_initial_buffer_size")]
    pub initial_size: usize,
    /// 读窗口上限
    #[serde(default = "default_max_buffer_size")]
    pub max_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_size: default_initial_buffer_size(),
            max_size: default_max_buffer_size(),
        }
    }
}

/// 服务器（网关）配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// QUIC 监听地址
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// QUIC 监听端口
    #[serde(default = "default_server_port")]
    pub listen_port: u16,
    /// 读取会话头与拨号目标的超时（秒）
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// 转发时每次读写的超时（秒），未设置时等于 connection_timeout_secs，0 表示不限制
    #[serde(default)]
    pub io_timeout_secs: Option<u64>,
    /// 性能统计采样间隔（毫秒）
    #[serde(default = "default_performance_interval_ms")]
    pub performance_interval_ms: u64,
    /// 证书路径（可选，不设置则自动生成自签名证书）
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// 私钥路径（可选）
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub quic: QuicConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_server_port(),
            connection_timeout_secs: default_connection_timeout_secs(),
            io_timeout_secs: None,
            performance_interval_ms: default_performance_interval_ms(),
            cert_path: None,
            key_path: None,
            quic: QuicConfig::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 创建 Builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_socket_addr(&self.listen_host, self.listen_port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        match self.io_timeout_secs {
            None => Some(self.connection_timeout()),
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }

    pub fn performance_interval(&self) -> Duration {
        Duration::from_millis(self.performance_interval_ms)
    }
}

/// 客户端（边缘节点）配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 本地 TCP 监听地址
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// 本地 TCP 监听端口
    #[serde(default = "default_client_port")]
    pub listen_port: u16,
    /// 网关地址（IP 或主机名）
    #[serde(default = "default_gateway_host")]
    pub gateway_host: String,
    /// 网关 QUIC 端口
    #[serde(default = "default_server_port")]
    pub gateway_port: u16,
    /// 多个 TCP 连接复用同一个 QUIC 会话
    #[serde(default = "default_multi_stream")]
    pub multi_stream: bool,
    /// 建立 QUIC 会话的尝试次数
    #[serde(default = "default_connection_retries")]
    pub connection_retries: u32,
    /// 单次建立会话的超时（秒）
    #[serde(default = "default_connection_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 性能统计采样间隔（毫秒）
    #[serde(default = "default_performance_interval_ms")]
    pub performance_interval_ms: u64,
    #[serde(default)]
    pub quic: QuicConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_client_port(),
            gateway_host: default_gateway_host(),
            gateway_port: default_server_port(),
            multi_stream: default_multi_stream(),
            connection_retries: default_connection_retries(),
            connect_timeout_secs: default_connection_timeout_secs(),
            performance_interval_ms: default_performance_interval_ms(),
            quic: QuicConfig::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl ClientConfig {
    /// 创建 Builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_config(self)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_socket_addr(&self.listen_host, self.listen_port)
    }

    /// 网关的 `host:port` 字符串，用于解析与日志
    pub fn gateway(&self) -> String {
        match self.gateway_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.gateway_port),
            _ => format!("{}:{}", self.gateway_host, self.gateway_port),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn performance_interval(&self) -> Duration {
        Duration::from_millis(self.performance_interval_ms)
    }
}

fn parse_socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", host))?;
    Ok(SocketAddr::new(ip, port))
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppConfig {
    Server(ServerConfig),
    Client(ClientConfig),
}

impl AppConfig {
    /// 从文件加载配置（根据 `[server]` / `[client]` 表自动检测类型）
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let table: toml::Table = toml::from_str(content).context("Failed to parse configuration")?;
        if table.contains_key("server") {
            let config = parse_server_config(content)?;
            Ok(AppConfig::Server(config))
        } else if table.contains_key("client") {
            let config = parse_client_config(content)?;
            Ok(AppConfig::Client(config))
        } else {
            anyhow::bail!("Configuration must contain a [server] or [client] table")
        }
    }

    /// 从文件加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        parse_server_config(&content)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        parse_client_config(&content)
    }
}

fn parse_server_config(content: &str) -> anyhow::Result<ServerConfig> {
    #[derive(Deserialize)]
    struct ServerConfigWrapper {
        server: ServerConfig,
    }

    let wrapper: ServerConfigWrapper =
        toml::from_str(content).context("Failed to parse server configuration")?;
    wrapper
        .server
        .validate()
        .context("Server configuration validation failed")?;
    Ok(wrapper.server)
}

fn parse_client_config(content: &str) -> anyhow::Result<ClientConfig> {
    #[derive(Deserialize)]
    struct ClientConfigWrapper {
        client: ClientConfig,
    }

    let wrapper: ClientConfigWrapper =
        toml::from_str(content).context("Failed to parse client configuration")?;
    wrapper
        .client
        .validate()
        .context("Client configuration validation failed")?;
    Ok(wrapper.client)
}
