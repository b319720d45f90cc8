use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::ServerState;

/// 周期性探测所有已注册隧道，移除失效的隧道
pub(crate) async fn run_health_monitor(state: Arc<ServerState>) {
    let period = state.config.health_check_interval();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成
    ticker.tick().await;

    info!("Health monitor started (period {:?})", period);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = check_tunnels(&state);
                if evicted > 0 {
                    info!(
                        "Health check evicted {} tunnel(s), {} remaining",
                        evicted,
                        state.registry.len()
                    );
                }
            }
        }
    }

    debug!("Health monitor stopped");
}

/// 探测一轮，返回本轮移除的隧道数
pub(crate) fn check_tunnels(state: &ServerState) -> usize {
    let mut evicted = 0;

    for handle in state.registry.snapshot() {
        if !handle.is_alive() {
            state.registry.remove(handle.id());
            continue;
        }

        if let Err(e) = handle.probe() {
            warn!(
                "Tunnel {} from {} failed liveness probe: {}",
                handle.id(),
                handle.peer_addr(),
                e
            );
            // 先标记失效再移除，之后的投递都会被退回
            if handle.mark_dead() {
                state.stats_manager.tunnel_evicted();
                evicted += 1;
            }
            state.registry.remove(handle.id());
        }
    }

    evicted
}
