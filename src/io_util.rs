/// 隧道数据泵 I/O 工具
///
/// 提供自适应读窗口的单向拷贝，以及带 linger 的 TCP 关闭
use socket2::SockRef;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP 关闭前等待未发送数据的时间
pub const DEFAULT_LINGER: Duration = Duration::from_secs(3);

/// 自适应读窗口
///
/// 每次成功拷贝 `n` 字节后，下一次读取大小为 `max(2n, initial)`，并以 `max` 封顶。
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveWindow {
    initial: usize,
    max: usize,
    next: usize,
}

impl AdaptiveWindow {
    pub fn new(initial: usize, max: usize) -> Self {
        let initial = initial.max(1);
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// 下一次读取的大小
    pub fn next_read_size(&self) -> usize {
        self.next
    }

    /// 记录一次成功拷贝的字节数
    pub fn record(&mut self, transferred: usize) {
        self.next = transferred
            .saturating_mul(2)
            .max(self.initial)
            .min(self.max);
    }
}

async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no progress within {:?}", limit),
            )
        })?,
        None => fut.await,
    }
}

/// 单向拷贝直到读端结束或出错
///
/// 每次读写都受 `deadline` 约束；`on_chunk` 在每块数据写出后调用，用于累计字节计数。
/// 返回拷贝的总字节数，写端的关闭由调用者负责。
pub async fn copy_adaptive<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    mut window: AdaptiveWindow,
    deadline: Option<Duration>,
    mut on_chunk: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; window.next_read_size()];
    let mut total = 0u64;

    loop {
        let size = window.next_read_size();
        if buf.len() < size {
            buf.resize(size, 0);
        }

        let n = with_deadline(deadline, reader.read(&mut buf[..size])).await?;
        if n == 0 {
            break;
        }
        with_deadline(deadline, writer.write_all(&buf[..n])).await?;

        total += n as u64;
        on_chunk(n);
        window.record(n);
    }

    with_deadline(deadline, writer.flush()).await?;
    Ok(total)
}

/// 以 linger 方式关闭 TCP 连接
///
/// 带 linger 的 close 可能阻塞，放到阻塞线程池中执行。
pub fn close_with_linger(stream: TcpStream, linger: Duration) {
    match stream.into_std() {
        Ok(std_stream) => {
            if let Err(e) = SockRef::from(&std_stream).set_linger(Some(linger)) {
                debug!("Failed to set SO_LINGER: {}", e);
            }
            tokio::task::spawn_blocking(move || drop(std_stream));
        }
        Err(e) => debug!("Failed to detach TCP stream for linger close: {}", e),
    }
}

/// 以 RST 立即断开 TCP 连接
pub fn reset_connection(stream: TcpStream) {
    if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!("Failed to set SO_LINGER: {}", e);
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_window_growth() {
        let mut window = AdaptiveWindow::new(4096, 64 * 1024);
        assert_eq!(window.next_read_size(), 4096);

        window.record(4096);
        assert_eq!(window.next_read_size(), 8192);

        window.record(100);
        assert_eq!(window.next_read_size(), 4096);

        window.record(60_000);
        assert_eq!(window.next_read_size(), 64 * 1024);
    }

    #[test]
    fn test_window_sanitizes_bounds() {
        let window = AdaptiveWindow::new(0, 0);
        assert_eq!(window.next_read_size(), 1);

        let mut window = AdaptiveWindow::new(4096, 1024);
        window.record(10_000);
        assert_eq!(window.next_read_size(), 4096);
    }

    #[tokio::test]
    async fn test_copy_adaptive_counts_chunks() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        let mut counted = 0usize;
        let total = copy_adaptive(
            &mut server,
            &mut out,
            AdaptiveWindow::new(4096, 1 << 20),
            Some(Duration::from_secs(5)),
            |n| counted += n,
        )
        .await
        .unwrap();

        assert_eq!(total, payload.len() as u64);
        assert_eq!(counted, payload.len());
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_copy_adaptive_read_deadline() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut out = Vec::new();
        let err = copy_adaptive(
            &mut server,
            &mut out,
            AdaptiveWindow::new(16, 64),
            Some(Duration::from_millis(50)),
            |_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_close_with_linger_delivers_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"flushed before close").await.unwrap();
        close_with_linger(stream, DEFAULT_LINGER);

        let received = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"flushed before close");
    }

    #[tokio::test]
    async fn test_reset_connection_ends_peer_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        reset_connection(stream);

        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
            .await
            .unwrap();
        // RST 表现为 reset 错误，也可能在部分平台上表现为 EOF
        match result {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }
}
