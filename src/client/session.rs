use crate::config::AgentConfig;
use crate::error::BrokerError;
use crate::framing::{response_status, FrameError, MessageFramer};
use crate::protocol::{registration_request, RequestLine};
use crate::socket::apply_keepalive;
use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::local;

/// 运行一条隧道会话：注册，然后串行处理代理转发来的请求
///
/// 代理关闭连接或 `shutdown` 被取消时正常返回。
pub async fn run_session(config: &AgentConfig, index: usize, shutdown: &CancellationToken) -> Result<()> {
    let endpoint = config.server_endpoint();
    let mut stream = timeout(config.connect_timeout(), TcpStream::connect(&endpoint))
        .await
        .with_context(|| format!("Timed out connecting to broker {}", endpoint))?
        .with_context(|| format!("Failed to connect to broker {}", endpoint))?;

    apply_keepalive(&stream, Some(Duration::from_secs(30)), Some(Duration::from_secs(10)));

    let mut framer = MessageFramer::new(config.max_header_size);
    register(&mut stream, &mut framer, config).await?;
    info!("Tunnel #{} registered with broker {}", index, endpoint);

    loop {
        let mut request = BytesMut::new();
        let result = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = framer.read_request(&mut stream, |chunk| request.extend_from_slice(&chunk)) => Some(result),
        };
        let Some(result) = result else {
            let _ = stream.shutdown().await;
            return Ok(());
        };

        match result {
            Ok(_) => {}
            Err(FrameError::SourceClosed) => {
                info!("Broker closed tunnel #{}", index);
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read request from broker"),
        }

        let method = RequestLine::parse(&request)
            .map(|line| line.method)
            .unwrap_or_else(|| "GET".to_string());
        debug!("Tunnel #{} relaying {} request ({} bytes)", index, method, request.len());

        let response = local::forward(config, &request, &method).await;
        stream
            .write_all(&response)
            .await
            .context("Failed to write response to broker")?;
        stream.flush().await?;
    }
}

/// 发送注册请求并等待 200 确认
async fn register(stream: &mut TcpStream, framer: &mut MessageFramer, config: &AgentConfig) -> Result<()> {
    let request = registration_request(&config.register_path, &config.server_endpoint());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = BytesMut::new();
    timeout(
        config.connect_timeout(),
        framer.read_response(stream, "GET", |chunk| reply.extend_from_slice(&chunk)),
    )
    .await
    .map_err(|_| BrokerError::registration("timed out waiting for confirmation"))?
    .map_err(BrokerError::from)?;

    match response_status(&reply) {
        Some(200) => Ok(()),
        Some(status) => Err(BrokerError::registration(format!(
            "broker answered with status {}",
            status
        ))
        .into()),
        None => Err(BrokerError::registration("unparsable confirmation").into()),
    }
}
