use crate::stats::StatsManager;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 启动统计数据 HTTP 服务器
pub async fn start_stats_server(
    addr: String,
    port: u16,
    stats_manager: StatsManager,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(format!("{}:{}", addr, port))
        .await
        .context("Failed to bind stats server port")?;

    info!("Stats server listening on http://{}:{}", addr, port);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((mut stream, peer)) => {
                    let stats_manager = stats_manager.clone();
                    tokio::spawn(async move {
                        handle_stats_request(&mut stream, peer, &stats_manager).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept stats connection: {}", e);
                }
            },
        }
    }

    Ok(())
}

/// 处理单个统计请求
async fn handle_stats_request(stream: &mut TcpStream, addr: SocketAddr, stats_manager: &StatsManager) {
    let mut buffer = vec![0u8; 4096];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to read from stats client {}: {}", addr, e);
            return;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = render_response(path, stats_manager);

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response to {}: {}", addr, e);
    }
    let _ = stream.shutdown().await;
}

fn render_response(path: &str, stats_manager: &StatsManager) -> String {
    if path == "/stats" || path == "/stats/" {
        let json = serde_json::to_string_pretty(&stats_manager.snapshot()).unwrap_or_default();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            json.len(),
            json
        )
    } else {
        let body = "404 Not Found";
        format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }
}
