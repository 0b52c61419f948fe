//! QUIC 握手所需的 TLS 材料
//!
//! 服务端默认在启动时生成一次性的自签名证书，仅用于满足 QUIC 强制的 TLS 握手。
//!
//! **安全说明**：客户端不校验服务端证书。隧道两端之间的信任由网络拓扑在带外建立，
//! 这是刻意的部署取舍而非疏漏；若要启用校验需要同时改变证书分发方式。
use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// 隧道协议的 ALPN 标识
pub const ALPN_PROTOCOL: &[u8] = b"qpep";

/// 客户端握手时使用的服务器名称（证书不被校验，只需与自签名证书一致）
pub const SERVER_NAME: &str = "localhost";

/// 服务端证书链与私钥
#[derive(Debug)]
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// 生成内存中的自签名证书
    pub fn self_signed(names: &[String]) -> Result<Self> {
        let mut names = names.to_vec();
        if !names.iter().any(|n| n == SERVER_NAME) {
            names.push(SERVER_NAME.to_string());
        }
        let certified = generate_simple_self_signed(names)
            .context("Failed to generate self-signed certificate")?;
        let key = PrivatePkcs8KeyDer::from(certified.signing_key.serialize_der());
        Ok(Self {
            certs: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(key),
        })
    }

    /// 从 PEM 文件加载证书与私钥
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_file = File::open(cert_path)
            .with_context(|| format!("Failed to open cert file: {:?}", cert_path))?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to parse certificates")?;
        if certs.is_empty() {
            anyhow::bail!("No certificate found in {:?}", cert_path);
        }

        let key_file = File::open(key_path)
            .with_context(|| format!("Failed to open key file: {:?}", key_path))?;
        let mut key_reader = BufReader::new(key_file);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .context("Failed to parse private key")?
            .context("No private key found")?;

        Ok(Self { certs, key })
    }

    /// 配置了证书路径则从文件加载，否则自签名
    pub fn load_or_generate(cert_path: Option<&Path>, key_path: Option<&Path>) -> Result<Self> {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key),
            (None, None) => Self::self_signed(&[]),
            _ => anyhow::bail!("cert_path and key_path must be set together"),
        }
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 构建服务端 TLS 配置（TLS 1.3 + 隧道 ALPN）
pub fn server_crypto_config(identity: TlsIdentity) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("Failed to select TLS 1.3")?
        .with_no_client_auth()
        .with_single_cert(identity.certs, identity.key)
        .context("Failed to create server config")?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// 构建客户端 TLS 配置，跳过服务端证书校验
pub fn client_crypto_config() -> Result<rustls::ClientConfig> {
    let provider = crypto_provider();
    let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("Failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// 不校验证书链的验证器，握手签名仍按算法校验
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_identity() {
        let identity = TlsIdentity::self_signed(&["gateway.local".to_string()]).unwrap();
        assert_eq!(identity.certs.len(), 1);
        assert!(!identity.certs[0].is_empty());
    }

    #[test]
    fn test_server_config_has_alpn() {
        let identity = TlsIdentity::self_signed(&[]).unwrap();
        let config = server_crypto_config(identity).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);
    }

    #[test]
    fn test_client_config_has_alpn() {
        let config = client_crypto_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);
    }

    #[test]
    fn test_pem_files_roundtrip() {
        let certified = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("quic-pep-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.signing_key.serialize_pem()).unwrap();

        let identity =
            TlsIdentity::load_or_generate(Some(&cert_path), Some(&key_path)).unwrap();
        assert_eq!(identity.certs.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_half_configured_paths_rejected() {
        let result = TlsIdentity::load_or_generate(Some(Path::new("cert.pem")), None);
        assert!(result.is_err());
    }
}
