use crate::config::{AgentConfig, ENV_PREFIX};
use crate::framing::MessageFramer;
use crate::protocol::bad_gateway;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// 本地服务连接重试延迟（毫秒）- 可通过环境变量 TUNNEL_BROKER_LOCAL_RETRY_DELAY_MS 覆盖
pub const LOCAL_RETRY_DELAY_MS: u64 = 200;

pub fn get_local_retry_delay() -> u64 {
    std::env::var(format!("{}LOCAL_RETRY_DELAY_MS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LOCAL_RETRY_DELAY_MS)
}

/// 把一个请求转发给本地服务，返回完整响应
///
/// 本地服务不可用或响应不完整时返回 502。响应在本地完整缓冲后才写回隧道，
/// 所以失败时隧道上不会出现半个响应。
pub async fn forward(config: &AgentConfig, request: &[u8], method: &str) -> Bytes {
    match try_forward(config, request, method).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                "Local service {} failed, answering 502: {:#}",
                config.local_endpoint(),
                e
            );
            bad_gateway()
        }
    }
}

async fn try_forward(config: &AgentConfig, request: &[u8], method: &str) -> Result<Bytes> {
    let mut stream = connect_local(config).await?;

    stream
        .write_all(request)
        .await
        .context("Failed to write request to local service")?;
    stream.flush().await?;

    let mut framer = MessageFramer::new(config.max_header_size);
    let mut response = BytesMut::new();
    let summary = framer
        .read_response(&mut stream, method, |chunk| response.extend_from_slice(&chunk))
        .await
        .context("Failed to read response from local service")?;

    debug!(
        "Local service answered {} {} bytes ({:?})",
        method,
        summary.total_len(),
        summary.framing
    );
    Ok(response.freeze())
}

/// 连接本地服务（带重试）
async fn connect_local(config: &AgentConfig) -> Result<TcpStream> {
    let endpoint = config.local_endpoint();
    let attempts = config.local_connect_retries.max(1);
    let retry_delay = Duration::from_millis(get_local_retry_delay());

    let mut last_error = None;
    for attempt in 1..=attempts {
        match timeout(config.connect_timeout(), TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!(
                    "Connect to local service {} failed (attempt {}/{}): {}",
                    endpoint, attempt, attempts, e
                );
                last_error = Some(anyhow::Error::from(e));
            }
            Err(_) => {
                debug!(
                    "Connect to local service {} timed out (attempt {}/{})",
                    endpoint, attempt, attempts
                );
                last_error = Some(anyhow::anyhow!("connect timed out"));
            }
        }

        if attempt < attempts {
            sleep(retry_delay).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no connection attempt made"))
        .context(format!("Failed to connect to local service {}", endpoint)))
}
