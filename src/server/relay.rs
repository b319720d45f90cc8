use bytes::Bytes;
use tokio::sync::mpsc;

/// 一次转发任务的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// 完整的响应已经送出
    Complete,
    /// 隧道在响应完成前失效（可能已经送出部分数据）
    TunnelLost,
}

/// 隧道工作任务向客户端工作任务推送的事件
#[derive(Debug)]
pub enum RelayEvent {
    /// 一段响应数据
    Chunk(Bytes),
    /// 结束标记，之后不会再有事件
    End(RelayOutcome),
}

/// 排队等待隧道处理的一个客户端请求
#[derive(Debug)]
pub struct RelayJob {
    request: Bytes,
    method: String,
    results: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayJob {
    /// 创建任务及其结果通道的接收端
    pub fn new(
        request: Bytes,
        method: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (results, rx) = mpsc::unbounded_channel();
        (
            Self {
                request,
                method: method.into(),
                results,
            },
            rx,
        )
    }

    /// 完整的原始请求字节
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// 请求方法，用于判断响应是否带消息体
    pub fn method(&self) -> &str {
        &self.method
    }

    /// 推送一段响应数据
    ///
    /// 客户端已经离开时静默丢弃，隧道仍需读完整个响应以保持同步。
    pub fn send_chunk(&self, chunk: Bytes) {
        let _ = self.results.send(RelayEvent::Chunk(chunk));
    }

    /// 推送结束标记并消费任务
    pub fn finish(self, outcome: RelayOutcome) {
        let _ = self.results.send(RelayEvent::End(outcome));
    }

    /// 客户端是否已经放弃等待
    pub fn is_abandoned(&self) -> bool {
        self.results.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_events_in_order() {
        let (job, mut rx) = RelayJob::new(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), "GET");
        assert_eq!(job.method(), "GET");

        job.send_chunk(Bytes::from_static(b"a"));
        job.send_chunk(Bytes::from_static(b"b"));
        job.finish(RelayOutcome::Complete);

        assert!(matches!(rx.recv().await, Some(RelayEvent::Chunk(c)) if c == "a"));
        assert!(matches!(rx.recv().await, Some(RelayEvent::Chunk(c)) if c == "b"));
        assert!(matches!(
            rx.recv().await,
            Some(RelayEvent::End(RelayOutcome::Complete))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_job() {
        let (job, rx) = RelayJob::new(Bytes::new(), "GET");
        assert!(!job.is_abandoned());
        drop(rx);
        assert!(job.is_abandoned());
        job.send_chunk(Bytes::from_static(b"ignored"));
        job.finish(RelayOutcome::TunnelLost);
    }
}
