mod connection;
mod dispatch;
mod health;
mod registry;
mod relay;
mod stats;
mod tunnel;

pub use dispatch::{classify, ConnectionKind};
pub use registry::{TunnelHandle, TunnelRegistry};
pub use relay::{RelayEvent, RelayJob, RelayOutcome};

use crate::config::ServerConfig;
use crate::rate_limiter::RateLimiter;
use crate::stats::StatsManager;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stats::start_stats_server;

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub stats_manager: StatsManager,
    pub registry: TunnelRegistry,
    pub rate_limiter: Option<RateLimiter>,
    /// 取消后服务器停止接受连接并关闭所有隧道
    pub shutdown: CancellationToken,
}

impl ServerDependencies {
    /// 创建默认依赖
    pub fn new() -> Self {
        Self {
            stats_manager: StatsManager::new(),
            registry: TunnelRegistry::new(),
            rate_limiter: None,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Default for ServerDependencies {
    fn default() -> Self {
        Self::new()
    }
}

/// 服务器共享状态
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub stats_manager: StatsManager,
    pub registry: TunnelRegistry,
    pub rate_limiter: Option<RateLimiter>,
    pub shutdown: CancellationToken,
}

impl ServerState {
    /// 从配置创建状态（使用默认依赖）
    pub fn new(config: ServerConfig) -> Result<Self> {
        let mut deps = ServerDependencies::new();
        deps.rate_limiter = config
            .rate_limit
            .as_ref()
            .map(RateLimiter::new)
            .transpose()
            .context("Invalid rate limit configuration")?;
        Ok(Self::with_dependencies(config, deps))
    }

    /// 从配置和依赖创建状态
    pub fn with_dependencies(config: ServerConfig, deps: ServerDependencies) -> Self {
        Self {
            config: Arc::new(config),
            stats_manager: deps.stats_manager,
            registry: deps.registry,
            rate_limiter: deps.rate_limiter,
            shutdown: deps.shutdown,
        }
    }
}

/// 运行服务器
pub async fn run_server(config: ServerConfig) -> Result<()> {
    run_server_with_dependencies(config, None).await
}

/// 运行服务器（带自定义依赖，用于测试）
pub async fn run_server_with_dependencies(
    config: ServerConfig,
    deps: Option<ServerDependencies>,
) -> Result<()> {
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let state = match deps {
        Some(deps) => ServerState::with_dependencies(config, deps),
        None => ServerState::new(config)?,
    };

    serve(listener, Arc::new(state)).await
}

/// 在已绑定的监听器上运行服务器，直到收到 Ctrl+C 或 `state.shutdown` 被取消
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(
        "Tunnel broker listening on {} (register path: {})",
        local_addr, state.config.register_path
    );

    // 如果配置了统计端口，启动HTTP统计服务器
    if let Some(stats_port) = state.config.stats_port {
        // 使用 stats_addr，如果未配置则回退到 bind_addr
        let stats_addr = state
            .config
            .stats_addr
            .as_ref()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| state.config.bind_addr.clone());

        let stats_manager = state.stats_manager.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_stats_server(stats_addr, stats_port, stats_manager, shutdown).await
            {
                error!("Stats server error: {}", e);
            }
        });
    }

    let monitor = tokio::spawn(health::run_health_monitor(Arc::clone(&state)));

    // 设置 Ctrl+C 处理
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => accept_connection(stream, peer_addr, &state),
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = &mut ctrl_c => {
                info!("Received shutdown signal, stopping broker...");
                break;
            }
            _ = state.shutdown.cancelled() => {
                info!("Shutdown requested, stopping broker...");
                break;
            }
        }
    }

    state.shutdown.cancel();
    for handle in state.registry.clear() {
        handle.mark_dead();
    }
    if let Err(e) = monitor.await {
        warn!("Health monitor task failed: {}", e);
    }

    info!("Broker stopped gracefully");
    Ok(())
}

fn accept_connection(stream: tokio::net::TcpStream, peer_addr: SocketAddr, state: &Arc<ServerState>) {
    // 应用速率限制
    if let Some(ref limiter) = state.rate_limiter {
        if let Err(wait_time) = limiter.try_acquire() {
            warn!(
                "Rate limit exceeded, rejecting connection from {} (retry after {:?})",
                peer_addr, wait_time
            );
            return;
        }
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let state = Arc::clone(state);
    tokio::spawn(dispatch::handle_connection(stream, peer_addr, state));
}
