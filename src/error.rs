/// 自定义错误类型
///
/// 使用 thiserror 定义隧道引擎的精确错误类型，
/// 应用边缘（配置加载、证书、main）仍使用 anyhow
use std::io;
use std::time::Duration;
use thiserror::Error;

/// QUIC PEP 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 会话头格式错误（截断、未知地址族等）
    #[error("Malformed session header: {0}")]
    MalformedHeader(String),

    /// 多次重试后仍无法建立 QUIC 会话
    #[error("QUIC session to {addr} unavailable after {attempts} attempt(s): {reason}")]
    SessionUnavailable {
        addr: String,
        attempts: u32,
        reason: String,
    },

    /// 无法在会话上打开新的流
    #[error("Failed to open QUIC stream: {0}")]
    StreamUnavailable(String),

    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 监听端口绑定失败（进程级致命错误）
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 统计计数器被写入负值
    #[error("Counter '{key}' cannot take negative value {value}")]
    NegativeCounter { key: String, value: f64 },

    /// TLS 配置错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建会话头格式错误
    pub fn malformed_header(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }

    /// 创建会话不可用错误
    pub fn session_unavailable(
        addr: impl Into<String>,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self::SessionUnavailable {
            addr: addr.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// 创建流不可用错误
    pub fn stream_unavailable(msg: impl Into<String>) -> Self {
        Self::StreamUnavailable(msg.into())
    }

    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建绑定失败错误
    pub fn bind_failed(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::BindFailed {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建 TLS 错误
    pub fn tls(msg: impl ToString) -> Self {
        Self::Tls(msg.to_string())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为会话头错误
    pub fn is_malformed_header(&self) -> bool {
        matches!(self, Self::MalformedHeader(_))
    }

    /// 检查是否为会话不可用
    pub fn is_session_unavailable(&self) -> bool {
        matches!(self, Self::SessionUnavailable { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    /// 检查是否为致命的绑定错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BindFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_header() {
        let err = TunnelError::malformed_header("unknown address family 9");
        assert!(err.is_malformed_header());
        assert_eq!(
            err.to_string(),
            "Malformed session header: unknown address family 9"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = TunnelError::timeout(Duration::from_secs(10));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_session_unavailable() {
        let err = TunnelError::session_unavailable("127.0.0.1:443", 3, "timed out");
        assert!(err.is_session_unavailable());
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "QUIC session to 127.0.0.1:443 unavailable after 3 attempt(s): timed out"
        );
    }

    #[test]
    fn test_bind_failed_is_fatal() {
        let err = TunnelError::bind_failed("0.0.0.0:443", "address in use");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("10.0.0.5:80", io_err);
        assert!(err.to_string().contains("10.0.0.5:80"));
    }

    #[test]
    fn test_negative_counter_message() {
        let err = TunnelError::NegativeCounter {
            key: "perf-up-count[10.0.0.5]".to_string(),
            value: -1.0,
        };
        assert!(err.to_string().contains("perf-up-count[10.0.0.5]"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
