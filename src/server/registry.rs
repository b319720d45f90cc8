use crate::socket::LivenessProbe;
use crate::stats::TunnelStatsTracker;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::relay::RelayJob;

/// 一条已注册隧道的共享句柄
///
/// 注册表、健康检查和客户端工作任务都只通过句柄访问隧道，
/// 连接本身只归隧道工作任务所有。
///
/// 任务队列的发送端在失效时被取走，投递与标记失效在同一把锁下互斥，
/// 句柄一旦失效就不会再收到新任务。
#[derive(Debug)]
pub struct TunnelHandle {
    id: Uuid,
    peer_addr: SocketAddr,
    jobs: Mutex<Option<mpsc::UnboundedSender<RelayJob>>>,
    cancel: CancellationToken,
    probe: LivenessProbe,
    tracker: TunnelStatsTracker,
}

impl TunnelHandle {
    /// 创建句柄，返回隧道工作任务使用的任务队列接收端
    pub fn new(
        id: Uuid,
        peer_addr: SocketAddr,
        probe: LivenessProbe,
        tracker: TunnelStatsTracker,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayJob>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            peer_addr,
            jobs: Mutex::new(Some(jobs)),
            cancel,
            probe,
            tracker,
        });
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn tracker(&self) -> &TunnelStatsTracker {
        &self.tracker
    }

    /// 把任务放进隧道队列
    ///
    /// 隧道已失效或队列已关闭时原样退回任务，调用方可以重新选择隧道。
    pub fn submit(&self, job: RelayJob) -> Result<(), RelayJob> {
        match self.jobs.lock().as_ref() {
            Some(jobs) => jobs.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.jobs
            .lock()
            .as_ref()
            .is_some_and(|jobs| !jobs.is_closed())
    }

    /// 标记失效并通知隧道工作任务退出
    ///
    /// 只有把句柄从存活变为失效的那次调用返回 `true`。
    pub fn mark_dead(&self) -> bool {
        let was_alive = self.jobs.lock().take().is_some();
        self.cancel.cancel();
        was_alive
    }

    /// 对底层连接执行一次非阻塞存活探测
    pub fn probe(&self) -> io::Result<()> {
        self.probe.check()
    }

    /// 等待句柄被取消
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Arc<TunnelHandle>>,
    cursor: usize,
}

#[derive(Default)]
struct RegistryInner {
    state: Mutex<RegistryState>,
    available: Notify,
}

/// 存活隧道的有序集合，支持轮询选择
///
/// 克隆后共享同一份数据。
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入新隧道并唤醒所有等待中的客户端
    pub fn register(&self, handle: Arc<TunnelHandle>) {
        self.inner.state.lock().entries.push(handle);
        self.inner.available.notify_waiters();
    }

    /// 按 id 移除隧道，重复移除是无害的
    pub fn remove(&self, id: Uuid) -> Option<Arc<TunnelHandle>> {
        let mut state = self.inner.state.lock();
        let pos = state.entries.iter().position(|h| h.id == id)?;
        let handle = state.entries.remove(pos);
        if pos < state.cursor {
            state.cursor -= 1;
        }
        Some(handle)
    }

    /// 立即按轮询顺序选出下一条存活隧道
    ///
    /// 遇到已失效的句柄会顺手移除。
    pub fn select_next(&self) -> Option<Arc<TunnelHandle>> {
        let mut state = self.inner.state.lock();

        let before = state.entries.len();
        state.entries.retain(|h| h.is_alive());
        if state.entries.len() != before {
            state.cursor = 0;
        }

        if state.entries.is_empty() {
            return None;
        }

        let index = state.cursor % state.entries.len();
        state.cursor = index + 1;
        Some(Arc::clone(&state.entries[index]))
    }

    /// 在截止时间前等待一条存活隧道
    ///
    /// 新隧道注册时立即被唤醒，不做轮询。
    pub async fn select_next_until(&self, deadline: Instant) -> Option<Arc<TunnelHandle>> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // 先登记再检查，避免错过检查与等待之间的注册
            notified.as_mut().enable();

            if let Some(handle) = self.select_next() {
                return Some(handle);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.select_next();
            }
        }
    }

    pub async fn select_next_within(
        &self,
        timeout: std::time::Duration,
    ) -> Option<Arc<TunnelHandle>> {
        self.select_next_until(Instant::now() + timeout).await
    }

    /// 当前所有隧道的快照
    pub fn snapshot(&self) -> Vec<Arc<TunnelHandle>> {
        self.inner.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空注册表，返回被移除的句柄
    pub fn clear(&self) -> Vec<Arc<TunnelHandle>> {
        let mut state = self.inner.state.lock();
        state.cursor = 0;
        std::mem::take(&mut state.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::relay::RelayOutcome;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    struct TestTunnel {
        handle: Arc<TunnelHandle>,
        jobs: mpsc::UnboundedReceiver<RelayJob>,
        _local: TcpStream,
        _remote: TcpStream,
    }

    async fn test_tunnel() -> TestTunnel {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (local, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (remote, peer) = accepted.unwrap();
        let local = local.unwrap();

        let id = Uuid::new_v4();
        let probe = LivenessProbe::from_stream(&local).unwrap();
        let (handle, jobs) = TunnelHandle::new(
            id,
            peer,
            probe,
            TunnelStatsTracker::new(id, peer),
            CancellationToken::new(),
        );
        TestTunnel {
            handle,
            jobs,
            _local: local,
            _remote: remote,
        }
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let registry = TunnelRegistry::new();
        let a = test_tunnel().await;
        let b = test_tunnel().await;
        let c = test_tunnel().await;
        registry.register(a.handle.clone());
        registry.register(b.handle.clone());
        registry.register(c.handle.clone());

        let picked: Vec<Uuid> = (0..6)
            .map(|_| registry.select_next().unwrap().id())
            .collect();
        let expected = [a.handle.id(), b.handle.id(), c.handle.id()];
        assert_eq!(&picked[..3], &expected);
        assert_eq!(&picked[3..], &expected);
    }

    #[tokio::test]
    async fn test_select_skips_dead_handles() {
        let registry = TunnelRegistry::new();
        let a = test_tunnel().await;
        let b = test_tunnel().await;
        registry.register(a.handle.clone());
        registry.register(b.handle.clone());

        a.handle.mark_dead();
        for _ in 0..3 {
            assert_eq!(registry.select_next().unwrap().id(), b.handle.id());
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = TunnelRegistry::new();
        let a = test_tunnel().await;
        registry.register(a.handle.clone());

        assert!(registry.remove(a.handle.id()).is_some());
        assert!(registry.remove(a.handle.id()).is_none());
        assert!(registry.is_empty());
        assert!(registry.select_next().is_none());
    }

    #[tokio::test]
    async fn test_remove_keeps_rotation_fair() {
        let registry = TunnelRegistry::new();
        let a = test_tunnel().await;
        let b = test_tunnel().await;
        let c = test_tunnel().await;
        registry.register(a.handle.clone());
        registry.register(b.handle.clone());
        registry.register(c.handle.clone());

        assert_eq!(registry.select_next().unwrap().id(), a.handle.id());
        registry.remove(a.handle.id());
        assert_eq!(registry.select_next().unwrap().id(), b.handle.id());
        assert_eq!(registry.select_next().unwrap().id(), c.handle.id());
    }

    #[tokio::test]
    async fn test_wait_times_out_when_empty() {
        let registry = TunnelRegistry::new();
        let started = Instant::now();
        let result = registry.select_next_within(Duration::from_millis(100)).await;
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_register() {
        let registry = TunnelRegistry::new();
        let a = test_tunnel().await;
        let id = a.handle.id();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.select_next_within(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        registry.register(a.handle.clone());

        let selected = waiter.await.unwrap().unwrap();
        assert_eq!(selected.id(), id);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_submit_returns_job_when_dead() {
        let mut a = test_tunnel().await;

        let (job, _rx) = RelayJob::new(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), "GET");
        assert!(a.handle.submit(job).is_ok());
        assert!(a.jobs.try_recv().is_ok());

        a.handle.mark_dead();
        let (job, mut rx) = RelayJob::new(Bytes::new(), "GET");
        let job = a.handle.submit(job).unwrap_err();
        job.finish(RelayOutcome::TunnelLost);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_mark_dead_reports_first_transition() {
        let a = test_tunnel().await;
        assert!(a.handle.mark_dead());
        assert!(!a.handle.mark_dead());
        assert!(!a.handle.is_alive());
    }

    #[tokio::test]
    async fn test_mark_dead_closes_queue_after_pending_jobs() {
        let mut a = test_tunnel().await;
        let (job, _rx) = RelayJob::new(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), "GET");
        a.handle.submit(job).unwrap();

        a.handle.mark_dead();
        // 失效前已入队的任务仍可取出，之后队列关闭
        assert!(a.jobs.recv().await.is_some());
        assert!(a.jobs.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_is_not_alive() {
        let a = test_tunnel().await;
        let handle = a.handle.clone();
        drop(a);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = TunnelRegistry::new();
        let a = test_tunnel().await;
        registry.register(a.handle.clone());
        assert_eq!(registry.clear().len(), 1);
        assert!(registry.is_empty());
    }
}
