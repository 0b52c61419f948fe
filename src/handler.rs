/// 隧道两端共用的生命周期接口
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

/// 隧道运行状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// 启动或运行失败，附带原因
    Failed(String),
}

impl fmt::Display for HandlerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerStatus::Stopped => write!(f, "stopped"),
            HandlerStatus::Starting => write!(f, "starting"),
            HandlerStatus::Running => write!(f, "running"),
            HandlerStatus::Stopping => write!(f, "stopping"),
            HandlerStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// 隧道处理器
///
/// `start` 一直运行到观察到关闭信号（或致命错误）才返回；
/// `stop` 触发关闭，并保证监听套接字和 QUIC 会话被释放。
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn health_check(&self) -> bool {
        self.status() == HandlerStatus::Running
    }

    fn status(&self) -> HandlerStatus;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(HandlerStatus::Running.to_string(), "running");
        assert_eq!(
            HandlerStatus::Failed("bind".to_string()).to_string(),
            "failed: bind"
        );
    }
}
