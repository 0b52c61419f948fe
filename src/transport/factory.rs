use crate::config::QuicConfig;
use crate::error::{Result, TunnelError};
use crate::tls::{client_crypto_config, server_crypto_config, TlsIdentity};
use quinn::congestion::{BbrConfig, CubicConfig, NewRenoConfig};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{AckFrequencyConfig, Endpoint, IdleTimeout, TransportConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 计算初始拥塞窗口时使用的数据包大小
const INITIAL_PACKET_SIZE: u64 = 1200;

/// 根据配置构建 quinn 传输参数
pub fn build_transport_config(quic: &QuicConfig) -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();

    let idle = IdleTimeout::try_from(quic.idle_timeout())
        .map_err(|e| TunnelError::config_error(format!("quic.idle_timeout_secs: {}", e)))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(quic.keep_alive_interval());
    transport.max_concurrent_bidi_streams(VarInt::from_u32(quic.max_incoming_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    let window = quic
        .initial_congestion_window_packets
        .map(|packets| u64::from(packets) * INITIAL_PACKET_SIZE);
    match quic.congestion {
        crate::transport::CongestionControl::Cubic => {
            let mut cc = CubicConfig::default();
            if let Some(window) = window {
                cc.initial_window(window);
            }
            transport.congestion_controller_factory(Arc::new(cc));
        }
        crate::transport::CongestionControl::NewReno => {
            let mut cc = NewRenoConfig::default();
            if let Some(window) = window {
                cc.initial_window(window);
            }
            transport.congestion_controller_factory(Arc::new(cc));
        }
        crate::transport::CongestionControl::Bbr => {
            let mut cc = BbrConfig::default();
            if let Some(window) = window {
                cc.initial_window(window);
            }
            transport.congestion_controller_factory(Arc::new(cc));
        }
    }

    // ACK 抽稀：仅在显式配置时启用
    if quic.ack_eliciting_threshold.is_some() || quic.max_ack_delay_ms.is_some() {
        let mut ack = AckFrequencyConfig::default();
        if let Some(threshold) = quic.ack_eliciting_threshold {
            ack.ack_eliciting_threshold(VarInt::from_u32(threshold));
        }
        if let Some(ms) = quic.max_ack_delay_ms {
            ack.max_ack_delay(Some(Duration::from_millis(ms)));
        }
        transport.ack_frequency_config(Some(ack));
    }

    Ok(transport)
}

/// 创建服务端 QUIC 端点，绑定失败返回 `BindFailed`
pub fn create_server_endpoint(
    addr: SocketAddr,
    identity: TlsIdentity,
    quic: &QuicConfig,
) -> Result<Endpoint> {
    let tls = server_crypto_config(identity).map_err(TunnelError::tls)?;
    let crypto = QuicServerConfig::try_from(tls).map_err(TunnelError::tls)?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(build_transport_config(quic)?));

    let endpoint = Endpoint::server(server_config, addr)
        .map_err(|e| TunnelError::bind_failed(addr.to_string(), e))?;
    debug!(
        "QUIC server endpoint bound on {} ({} congestion)",
        addr, quic.congestion
    );
    Ok(endpoint)
}

/// 创建客户端 QUIC 端点
pub fn create_client_endpoint(bind: SocketAddr, quic: &QuicConfig) -> Result<Endpoint> {
    let tls = client_crypto_config().map_err(TunnelError::tls)?;
    let crypto = QuicClientConfig::try_from(tls).map_err(TunnelError::tls)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(build_transport_config(quic)?));

    let mut endpoint =
        Endpoint::client(bind).map_err(|e| TunnelError::bind_failed(bind.to_string(), e))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CongestionControl;

    #[test]
    fn test_build_transport_defaults() {
        assert!(build_transport_config(&QuicConfig::default()).is_ok());
    }

    #[test]
    fn test_build_transport_all_knobs() {
        for congestion in [
            CongestionControl::Cubic,
            CongestionControl::NewReno,
            CongestionControl::Bbr,
        ] {
            let quic = QuicConfig {
                congestion,
                keep_alive_secs: Some(15),
                initial_congestion_window_packets: Some(4),
                ack_eliciting_threshold: Some(10),
                max_ack_delay_ms: Some(25),
                ..Default::default()
            };
            assert!(build_transport_config(&quic).is_ok());
        }
    }

    #[tokio::test]
    async fn test_endpoints_bind_ephemeral() {
        let identity = TlsIdentity::self_signed(&[]).unwrap();
        let server = create_server_endpoint(
            "127.0.0.1:0".parse().unwrap(),
            identity,
            &QuicConfig::default(),
        )
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let client =
            create_client_endpoint("127.0.0.1:0".parse().unwrap(), &QuicConfig::default()).unwrap();
        assert_ne!(client.local_addr().unwrap().port(), 0);
    }
}
