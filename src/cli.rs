use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "quic-pep")]
#[command(author, version, about = "QUIC-based TCP performance-enhancing proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，设置 RUST_LOG 时以其为准
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行网关（服务端）
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 运行边缘节点（客户端）
    Client {
        /// 配置文件路径
        #[arg(short, long, default_value = "client.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
    /// 生成示例配置
    Template {
        /// 配置类型 (server, client)
        #[arg(value_parser = ["server", "client"])]
        template_type: String,

        /// 输出文件路径，不指定则打印到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
}
