/// 隧道连接的套接字辅助功能：TCP keepalive 与存活探测
use socket2::{SockRef, Socket, TcpKeepalive};
use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 为连接开启 TCP keepalive，让内核发现静默消失的对端
pub fn apply_keepalive(stream: &TcpStream, time: Option<Duration>, interval: Option<Duration>) {
    if time.is_none() && interval.is_none() {
        return;
    }

    let mut keepalive = TcpKeepalive::new();
    if let Some(time) = time {
        keepalive = keepalive.with_time(time);
    }
    if let Some(interval) = interval {
        keepalive = keepalive.with_interval(interval);
    }

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

/// 隧道连接的存活探测器
///
/// 持有同一套接字的复制句柄，由健康检查任务独立使用，
/// 不会和隧道工作任务争用连接本身。复制句柄与原连接共享非阻塞标志，
/// 所以探测从不阻塞。
#[derive(Debug)]
pub struct LivenessProbe {
    socket: Socket,
}

impl LivenessProbe {
    /// 从隧道连接创建探测器
    pub fn from_stream(stream: &TcpStream) -> io::Result<Self> {
        let socket = SockRef::from(stream).try_clone()?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// 执行一次探测
    ///
    /// 依次检查挂起的套接字错误、零长度写入以及对端是否已关闭（peek 不消费数据）。
    pub fn check(&self) -> io::Result<()> {
        if let Some(err) = self.socket.take_error()? {
            return Err(err);
        }

        match self.socket.send(&[]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let mut buf = [MaybeUninit::<u8>::uninit(); 1];
        match self.socket.peek(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the tunnel",
            )),
            Ok(_) => {
                debug!("Tunnel has unread data pending, treating as alive");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
