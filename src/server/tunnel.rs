use crate::error::{BrokerError, Result};
use crate::framing::{FrameError, MessageFramer};
use crate::protocol::registration_confirmation;
use crate::socket::{apply_keepalive, LivenessProbe};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::TunnelHandle;
use super::relay::{RelayJob, RelayOutcome};
use super::ServerState;

/// 处理一条注册连接：完成握手后在连接上串行转发请求，直到隧道失效
///
/// `prefix` 是分发阶段已经从连接上读到的字节。
pub(crate) async fn run_tunnel(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    prefix: Bytes,
    state: Arc<ServerState>,
) {
    let mut framer = MessageFramer::with_prefix(&prefix, state.config.max_header_size);

    let (handle, jobs) = match register(&mut stream, peer_addr, &mut framer, &state).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Tunnel registration from {} failed: {}", peer_addr, e);
            let _ = stream.shutdown().await;
            return;
        }
    };

    let id = handle.id();
    info!(
        "Tunnel {} registered from {} ({} active)",
        id,
        peer_addr,
        state.registry.len()
    );

    let reason = relay_loop(&mut stream, &mut framer, &handle, jobs).await;

    handle.mark_dead();
    state.registry.remove(id);
    state.stats_manager.unregister_tunnel(&id);
    let _ = stream.shutdown().await;

    info!(
        "Tunnel {} from {} closed: {} ({} active)",
        id,
        peer_addr,
        reason,
        state.registry.len()
    );
}

/// 读完注册请求、回复确认并加入注册表
async fn register(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    framer: &mut MessageFramer,
    state: &ServerState,
) -> Result<(Arc<TunnelHandle>, mpsc::UnboundedReceiver<RelayJob>)> {
    tokio::time::timeout(
        state.config.request_timeout(),
        framer.read_request(stream, |_| {}),
    )
    .await
    .map_err(|_| BrokerError::registration("timed out reading registration request"))??;

    if framer.buffered() > 0 {
        debug!(
            "Tunnel {} sent {} bytes after its registration request, kept in buffer",
            peer_addr,
            framer.buffered()
        );
    }

    stream.write_all(&registration_confirmation()).await?;
    stream.flush().await?;

    apply_keepalive(
        stream,
        state.config.keepalive.time(),
        state.config.keepalive.interval(),
    );
    let probe = LivenessProbe::from_stream(stream)?;

    let id = Uuid::new_v4();
    let tracker = state.stats_manager.register_tunnel(id, peer_addr);
    let (handle, jobs) = TunnelHandle::new(
        id,
        peer_addr,
        probe,
        tracker,
        state.shutdown.child_token(),
    );
    state.registry.register(Arc::clone(&handle));

    Ok((handle, jobs))
}

/// 按到达顺序逐个处理任务，返回退出原因
async fn relay_loop(
    stream: &mut TcpStream,
    framer: &mut MessageFramer,
    handle: &TunnelHandle,
    mut jobs: mpsc::UnboundedReceiver<RelayJob>,
) -> String {
    let reason = loop {
        let job = tokio::select! {
            _ = handle.cancelled() => break "cancelled".to_string(),
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break "job queue closed".to_string(),
            },
        };

        if job.is_abandoned() {
            debug!("Skipping job abandoned by its client on tunnel {}", handle.id());
            continue;
        }

        let result = tokio::select! {
            _ = handle.cancelled() => None,
            result = relay_one(stream, framer, &job) => Some(result),
        };

        match result {
            Some(Ok(response_len)) => {
                handle
                    .tracker()
                    .request_relayed(job.request().len() as u64, response_len);
                job.finish(RelayOutcome::Complete);
            }
            Some(Err(e)) => {
                handle.tracker().request_failed();
                job.finish(RelayOutcome::TunnelLost);
                break format!("relay failed: {}", e);
            }
            None => {
                handle.tracker().request_failed();
                job.finish(RelayOutcome::TunnelLost);
                break "cancelled during relay".to_string();
            }
        }
    };

    // 队列里剩下的任务不会再被处理，逐个放行对应的客户端
    handle.mark_dead();
    jobs.close();
    let mut drained = 0;
    while let Ok(job) = jobs.try_recv() {
        job.finish(RelayOutcome::TunnelLost);
        drained += 1;
    }
    if drained > 0 {
        debug!(
            "Released {} queued jobs from tunnel {}",
            drained,
            handle.id()
        );
    }

    reason
}

/// 写出请求并把响应逐段推给客户端，返回响应字节数
async fn relay_one(
    stream: &mut TcpStream,
    framer: &mut MessageFramer,
    job: &RelayJob,
) -> std::result::Result<u64, FrameError> {
    stream.write_all(job.request()).await?;
    stream.flush().await?;

    let summary = framer
        .read_response(stream, job.method(), |chunk| job.send_chunk(chunk))
        .await?;
    Ok(summary.total_len())
}
