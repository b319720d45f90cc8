use crate::protocol::RequestLine;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{connection, tunnel, ServerState};

/// 连接的分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    /// 隧道对端的注册请求
    Registration,
    /// 需要转发的普通客户端请求
    Client(RequestLine),
    /// 无法解析请求行，静默关闭
    Malformed,
}

/// 根据首次读取的数据判断连接类型
pub fn classify(first: &[u8], register_path: &str) -> ConnectionKind {
    match RequestLine::parse(first) {
        Some(line) if line.is_registration(register_path) => ConnectionKind::Registration,
        Some(line) => ConnectionKind::Client(line),
        None => ConnectionKind::Malformed,
    }
}

/// 每个入站连接的入口：读一次，分类后交给对应的工作任务
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) {
    let mut buf = vec![0u8; state.config.read_buffer_size];
    let read = tokio::time::timeout(state.config.request_timeout(), stream.read(&mut buf)).await;

    let n = match read {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) => {
            debug!("Connection from {} closed before sending data", peer_addr);
            state.stats_manager.malformed_connection();
            return;
        }
        Ok(Err(e)) => {
            debug!("Failed to read from {}: {}", peer_addr, e);
            state.stats_manager.malformed_connection();
            return;
        }
        Err(_) => {
            debug!("Connection from {} sent nothing in time, closing", peer_addr);
            state.stats_manager.malformed_connection();
            let _ = stream.shutdown().await;
            return;
        }
    };
    buf.truncate(n);
    let first = Bytes::from(buf);

    match classify(&first, &state.config.register_path) {
        ConnectionKind::Registration => {
            tunnel::run_tunnel(stream, peer_addr, first, state).await;
        }
        ConnectionKind::Client(line) => {
            connection::handle_client(stream, peer_addr, first, line, state).await;
        }
        ConnectionKind::Malformed => {
            debug!("Malformed request line from {}, closing", peer_addr);
            state.stats_manager.malformed_connection();
            let _ = stream.shutdown().await;
        }
    }
}
