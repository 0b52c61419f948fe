use anyhow::{bail, Result};
use std::net::IpAddr;
use tracing::warn;

use super::{BufferConfig, ClientConfig, QuicConfig, ServerConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证监听地址必须为 IP
    pub fn validate_ip(addr: &str, context: &str) -> Result<()> {
        Self::validate_address(addr, context)?;
        if addr.parse::<IpAddr>().is_err() {
            bail!("{}: '{}' is not a valid IP address", context, addr);
        }
        Ok(())
    }

    /// 验证超时大于 0
    pub fn validate_timeout(secs: u64, context: &str) -> Result<()> {
        if secs == 0 {
            bail!("{}: timeout must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证 QUIC 传输参数
    pub fn validate_quic_config(config: &QuicConfig) -> Result<()> {
        Self::validate_timeout(config.idle_timeout_secs, "quic.idle_timeout_secs")?;
        if config.max_incoming_streams == 0 {
            bail!("quic.max_incoming_streams must be greater than 0");
        }
        if config.initial_congestion_window_packets == Some(0) {
            bail!("quic.initial_congestion_window_packets must be greater than 0");
        }
        if config.ack_eliciting_threshold == Some(0) {
            bail!("quic.ack_eliciting_threshold must be greater than 0");
        }
        if let Some(keep_alive) = config.keep_alive_secs {
            if keep_alive == 0 {
                bail!("quic.keep_alive_secs must be greater than 0");
            }
            if keep_alive >= config.idle_timeout_secs {
                warn!(
                    "quic.keep_alive_secs ({}) is not shorter than idle_timeout_secs ({}), \
                     idle sessions may still expire",
                    keep_alive, config.idle_timeout_secs
                );
            }
        }
        Ok(())
    }

    /// 验证自适应读窗口参数
    pub fn validate_buffer_config(config: &BufferConfig) -> Result<()> {
        if config.initial_size == 0 {
            bail!("buffer.initial_size must be greater than 0");
        }
        if config.initial_size > config.max_size {
            bail!(
                "buffer.initial_size ({}) cannot be greater than max_size ({})",
                config.initial_size,
                config.max_size
            );
        }
        Ok(())
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        Self::validate_ip(&config.listen_host, "Server listen_host")?;
        Self::validate_port(config.listen_port, "Server listen_port")?;
        Self::validate_timeout(config.connection_timeout_secs, "Server connection_timeout_secs")?;

        // 验证证书配置
        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        Self::validate_quic_config(&config.quic)?;
        Self::validate_buffer_config(&config.buffer)?;
        Ok(())
    }

    /// 验证客户端配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_ip(&config.listen_host, "Client listen_host")?;
        Self::validate_port(config.listen_port, "Client listen_port")?;
        Self::validate_address(&config.gateway_host, "Client gateway_host")?;
        Self::validate_port(config.gateway_port, "Client gateway_port")?;
        Self::validate_timeout(config.connect_timeout_secs, "Client connect_timeout_secs")?;

        if config.connection_retries == 0 {
            bail!("connection_retries must be at least 1");
        }

        // 网关与本地监听位于同一主机时端口不能冲突
        let same_host = config.gateway_host == config.listen_host
            || (config.listen_host == "0.0.0.0"
                && matches!(config.gateway_host.parse::<IpAddr>(), Ok(ip) if ip.is_loopback()));
        if same_host && config.listen_port == config.gateway_port {
            bail!(
                "listen_port and gateway_port must differ when the gateway is local ({})",
                config.listen_port
            );
        }

        Self::validate_quic_config(&config.quic)?;
        Self::validate_buffer_config(&config.buffer)?;
        Ok(())
    }
}
