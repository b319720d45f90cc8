use crate::error::{BrokerError, Result};
use crate::framing::{FrameError, MessageFramer};
use crate::protocol::{headers_too_large, payload_too_large, service_unavailable, RequestLine};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::relay::{RelayEvent, RelayJob, RelayOutcome};
use super::ServerState;

/// 处理一个普通客户端请求：交给某条隧道，把响应原样写回，然后关闭连接
pub(crate) async fn handle_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    prefix: Bytes,
    line: RequestLine,
    state: Arc<ServerState>,
) {
    state.stats_manager.client_accepted();
    debug!("Client {} requested {} {}", peer_addr, line.method, line.path);

    match relay_request(&mut stream, peer_addr, prefix, &line, &state).await {
        Ok((tunnel_id, written)) => {
            debug!("Relayed {} bytes to {} via tunnel {}", written, peer_addr, tunnel_id)
        }
        Err(e) => reject(&mut stream, peer_addr, e, &state).await,
    }

    let _ = stream.shutdown().await;
}

/// 读完请求、选出隧道并转发响应，返回隧道 id 和写回的字节数
async fn relay_request(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    prefix: Bytes,
    line: &RequestLine,
    state: &ServerState,
) -> Result<(Uuid, u64)> {
    let request = read_full_request(stream, peer_addr, prefix, state).await?;

    let (job, results) = RelayJob::new(request, line.method.as_str());
    let tunnel_id = dispatch(state, job).await?;
    state.stats_manager.client_relayed();
    debug!("Client {} queued on tunnel {}", peer_addr, tunnel_id);

    let written = stream_response(stream, tunnel_id, results).await?;
    Ok((tunnel_id, written))
}

/// 在等待时限内把任务交给一条存活隧道
async fn dispatch(state: &ServerState, mut job: RelayJob) -> Result<Uuid> {
    let deadline = Instant::now() + state.config.tunnel_wait();
    loop {
        let Some(handle) = state.registry.select_next_until(deadline).await else {
            return Err(BrokerError::no_tunnel(state.config.tunnel_wait()));
        };

        match handle.submit(job) {
            Ok(()) => return Ok(handle.id()),
            Err(returned) => {
                // 选中后隧道失效，换下一条
                debug!("Tunnel {} died before accepting job, reselecting", handle.id());
                state.registry.remove(handle.id());
                job = returned;
            }
        }
    }
}

/// 按到达顺序把响应片段写给客户端
async fn stream_response(
    stream: &mut TcpStream,
    tunnel_id: Uuid,
    mut results: mpsc::UnboundedReceiver<RelayEvent>,
) -> Result<u64> {
    let mut written = 0u64;
    loop {
        match results.recv().await {
            Some(RelayEvent::Chunk(chunk)) => {
                stream.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            Some(RelayEvent::End(RelayOutcome::Complete)) => return Ok(written),
            Some(RelayEvent::End(RelayOutcome::TunnelLost)) | None => {
                debug!("Tunnel {} lost after {} response bytes", tunnel_id, written);
                return Err(BrokerError::tunnel_lost(tunnel_id));
            }
        }
    }
}

/// 按失败原因给客户端一个收尾
async fn reject(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    err: BrokerError,
    state: &ServerState,
) {
    if err.is_rejected_request() {
        state.stats_manager.incomplete_request();
    }

    let response = match &err {
        BrokerError::NoTunnelAvailable { .. } => {
            state.stats_manager.client_rejected();
            info!("{} for {}, responding 503", err, peer_addr);
            Some(service_unavailable())
        }
        BrokerError::TunnelLost { .. } => {
            warn!("{} while serving {}", err, peer_addr);
            None
        }
        BrokerError::Framing(FrameError::HeadersTooLarge { .. }) => {
            info!("Rejecting request from {}: {}", peer_addr, err);
            Some(headers_too_large())
        }
        BrokerError::Framing(FrameError::BodyTooLarge { .. }) => {
            info!("Rejecting request from {}: {}", peer_addr, err);
            Some(payload_too_large())
        }
        _ if err.is_rejected_request() => {
            debug!("Dropping incomplete request from {}: {}", peer_addr, err);
            None
        }
        _ => {
            debug!("Client {} went away: {}", peer_addr, err);
            None
        }
    };

    if let Some(response) = response {
        if let Err(e) = stream.write_all(&response).await {
            debug!("Failed to write rejection to {}: {}", peer_addr, e);
        }
    }
}

/// 读取完整请求
///
/// 隧道对端只认完整的消息，请求没读完（超时、客户端提前关闭、超过大小限制）
/// 时返回错误，已读到的字节不会进入任何隧道。
async fn read_full_request(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    prefix: Bytes,
    state: &ServerState,
) -> Result<Bytes> {
    let mut framer = MessageFramer::with_prefix(&prefix, state.config.max_header_size)
        .with_body_limit(state.config.max_body_size);
    let mut request = BytesMut::with_capacity(prefix.len());

    let summary = tokio::time::timeout(
        state.config.request_timeout(),
        framer.read_request(stream, |chunk| request.extend_from_slice(&chunk)),
    )
    .await
    .map_err(|_| BrokerError::RequestTimeout {
        waited: state.config.request_timeout(),
    })??;

    if framer.buffered() > 0 {
        debug!(
            "Dropping {} bytes sent by {} after its request",
            framer.buffered(),
            peer_addr
        );
    }
    debug!(
        "Read {} byte request from {} ({:?})",
        summary.total_len(),
        peer_addr,
        summary.framing
    );

    Ok(request.freeze())
}
