/// QUIC PEP 库入口
///
/// 将隧道引擎导出为库，方便测试和嵌入
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod handler;
pub mod io_util;
pub mod performance;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use client::{ClientTunnel, DiversionLookup, TunnelStream};
pub use config::{AppConfig, ClientConfig, ServerConfig};
pub use error::{Result, TunnelError};
pub use handler::{HandlerStatus, TunnelHandler};
pub use performance::PerformanceWatcher;
pub use protocol::SessionHeader;
pub use server::ServerTunnel;
pub use stats::Statistics;
