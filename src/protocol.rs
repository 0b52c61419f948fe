/// 隧道会话头协议
///
/// 每条 QUIC 流的开头写入一次会话头，携带被代理连接的源地址和目的地址。
/// 每个地址的编码为：
///
/// ```text
/// +--------+----------------+----------+
/// | family | ip (4 / 16 B)  | port BE  |
/// +--------+----------------+----------+
/// ```
///
/// family 为 `4` (IPv4) 或 `6` (IPv6)，先源地址后目的地址。
use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// IPv4 地址族标记
pub const FAMILY_V4: u8 = 4;
/// IPv6 地址族标记
pub const FAMILY_V6: u8 = 6;
/// 会话头最大长度（两个 IPv6 地址）
pub const MAX_HEADER_LEN: usize = 2 * (1 + 16 + 2);

/// 流会话头
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHeader {
    /// 原始连接的源地址
    pub source: SocketAddr,
    /// 原始连接的目的地址（服务端据此拨号）
    pub destination: SocketAddr,
}

impl SessionHeader {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// 编码后的字节长度
    pub fn encoded_len(&self) -> usize {
        addr_len(&self.source) + addr_len(&self.destination)
    }

    /// 编码为二进制
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        put_addr(&mut buf, &self.source);
        put_addr(&mut buf, &self.destination);
        buf.freeze()
    }

    /// 从缓冲区解码，返回会话头以及消耗的字节数
    pub fn decode(mut buf: &[u8]) -> Result<(Self, usize)> {
        let total = buf.len();
        let source = get_addr(&mut buf)?;
        let destination = get_addr(&mut buf)?;
        Ok((Self::new(source, destination), total - buf.remaining()))
    }

    /// 从异步流中读取会话头
    ///
    /// 只读取会话头本身的字节，之后的数据原样留在流中。
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let source = read_addr(reader).await?;
        let destination = read_addr(reader).await?;
        Ok(Self::new(source, destination))
    }
}

impl fmt::Display for SessionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

fn addr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

fn ip_len(family: u8) -> Result<usize> {
    match family {
        FAMILY_V4 => Ok(4),
        FAMILY_V6 => Ok(16),
        other => Err(TunnelError::malformed_header(format!(
            "unknown address family {}",
            other
        ))),
    }
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn build_addr(family: u8, ip: &[u8], port: u16) -> SocketAddr {
    let ip = if family == FAMILY_V4 {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(ip);
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(ip);
        IpAddr::V6(Ipv6Addr::from(octets))
    };
    SocketAddr::new(ip, port)
}

fn get_addr(buf: &mut &[u8]) -> Result<SocketAddr> {
    if !buf.has_remaining() {
        return Err(TunnelError::malformed_header("header truncated"));
    }
    let family = buf.get_u8();
    let len = ip_len(family)?;
    if buf.remaining() < len + 2 {
        return Err(TunnelError::malformed_header(format!(
            "header truncated: need {} more byte(s), have {}",
            len + 2,
            buf.remaining()
        )));
    }
    let ip = &buf[..len];
    let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
    let addr = build_addr(family, ip, port);
    buf.advance(len + 2);
    Ok(addr)
}

async fn read_addr<R>(reader: &mut R) -> Result<SocketAddr>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let family = read_exact_or_malformed(reader, 1).await?[0];
    let len = ip_len(family)?;
    let rest = read_exact_or_malformed(reader, len + 2).await?;
    let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
    Ok(build_addr(family, &rest[..len], port))
}

async fn read_exact_or_malformed<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TunnelError::malformed_header(format!("stream ended before header: {}", e)))?;
    Ok(buf)
}
