mod local;
mod session;

pub use local::forward;
pub use session::run_session;

use crate::config::AgentConfig;
use anyhow::Result;
use futures::future::join_all;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 运行隧道对端（带自动重连），直到收到 Ctrl+C
pub async fn run_client(config: AgentConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping agent...");
        }
        signal.cancel();
    });

    run_client_with_shutdown(config, shutdown).await
}

/// 运行隧道对端，`shutdown` 取消后所有会话退出
///
/// 同时维持 `config.tunnels` 条隧道，每条独立重连。
pub async fn run_client_with_shutdown(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
    info!(
        "Starting agent: {} tunnel(s) to {} forwarding to {}",
        config.tunnels,
        config.server_endpoint(),
        config.local_endpoint()
    );

    let sessions = (0..config.tunnels).map(|index| run_tunnel_loop(&config, index, &shutdown));
    join_all(sessions).await;

    info!("Agent stopped");
    Ok(())
}

/// 单条隧道的重连循环
async fn run_tunnel_loop(config: &AgentConfig, index: usize, shutdown: &CancellationToken) {
    loop {
        match run_session(config, index, shutdown).await {
            Ok(()) => info!("Tunnel #{} session ended", index),
            Err(e) => error!("Tunnel #{} session error: {:#}", index, e),
        }

        if shutdown.is_cancelled() {
            break;
        }

        let delay = config.reconnect_delay();
        warn!("Tunnel #{} reconnecting in {:?}...", index, delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
}
