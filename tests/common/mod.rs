//! Common utilities for integration tests
#![allow(dead_code)]

use bytes::BytesMut;
use http_tunnel_broker::config::ServerConfig;
use http_tunnel_broker::framing::MessageFramer;
use http_tunnel_broker::protocol::registration_confirmation;
use http_tunnel_broker::server::{serve, ServerDependencies, ServerState, TunnelRegistry};
use http_tunnel_broker::stats::StatsManager;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Broker config with short timers for tests
pub fn test_server_config() -> ServerConfig {
    ServerConfig::builder()
        .bind_addr("127.0.0.1")
        .tunnel_wait_ms(500)
        .health_check_interval_ms(100)
        .request_timeout_ms(2000)
        .build()
        .expect("Invalid test config")
}

/// A broker running on an ephemeral port
pub struct TestBroker {
    pub addr: SocketAddr,
    pub registry: TunnelRegistry,
    pub stats: StatsManager,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<anyhow::Result<()>>,
}

impl TestBroker {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Start a broker with the given config on 127.0.0.1:0
pub async fn start_broker(config: ServerConfig) -> TestBroker {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind broker");
    let addr = listener.local_addr().expect("Failed to get broker addr");

    let deps = ServerDependencies::new();
    let registry = deps.registry.clone();
    let stats = deps.stats_manager.clone();
    let shutdown = deps.shutdown.clone();

    let state = Arc::new(ServerState::with_dependencies(config, deps));
    let task = tokio::spawn(serve(listener, state));

    TestBroker {
        addr,
        registry,
        stats,
        shutdown,
        task,
    }
}

/// Wait until the registry holds exactly `count` tunnels
pub async fn wait_for_tunnels(registry: &TunnelRegistry, count: usize, max_wait: Duration) -> bool {
    let deadline = Instant::now() + max_wait;
    while Instant::now() < deadline {
        if registry.len() == count {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    registry.len() == count
}

/// Send raw bytes as a client and read until the broker closes the connection
pub async fn send_request(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to broker");
    stream
        .write_all(request)
        .await
        .expect("Failed to write request");

    let mut response = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("Timeout waiting for broker to close the connection")
        .expect("Failed to read response");
    response
}

/// Like `send_request`, but tolerates resets and returns whatever arrived
pub async fn try_send_request(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let Ok(mut stream) = TcpStream::connect(addr).await else {
        return Vec::new();
    };
    if stream.write_all(request).await.is_err() {
        return Vec::new();
    }
    let mut response = Vec::new();
    let _ = timeout(Duration::from_secs(10), stream.read_to_end(&mut response)).await;
    response
}

/// A tunnel peer driven directly by the test
pub struct RawTunnel {
    pub stream: TcpStream,
    framer: MessageFramer,
}

impl RawTunnel {
    /// Connect, register and check the confirmation bytes
    pub async fn register(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect tunnel");
        stream
            .write_all(b"GET /register HTTP/1.1\r\nHost: broker\r\n\r\n")
            .await
            .expect("Failed to send registration");

        let mut framer = MessageFramer::new(8192);
        let mut reply = BytesMut::new();
        timeout(
            Duration::from_secs(5),
            framer.read_response(&mut stream, "GET", |c| reply.extend_from_slice(&c)),
        )
        .await
        .expect("Timeout waiting for confirmation")
        .expect("Failed to read confirmation");
        assert_eq!(&reply[..], &registration_confirmation()[..]);

        Self { stream, framer }
    }

    /// Read the next relayed request, `None` when the broker closed the tunnel
    pub async fn next_request(&mut self) -> Option<Vec<u8>> {
        let mut request = BytesMut::new();
        match self
            .framer
            .read_request(&mut self.stream, |c| request.extend_from_slice(&c))
            .await
        {
            Ok(_) => Some(request.to_vec()),
            Err(_) => None,
        }
    }

    pub async fn respond(&mut self, response: &[u8]) {
        self.stream
            .write_all(response)
            .await
            .expect("Failed to write response");
    }
}

/// Build a response whose body is `body`
pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Register a tunnel that answers every request with `<tag> <path>`
pub async fn start_tagged_tunnel(addr: SocketAddr, tag: &'static str) -> JoinHandle<()> {
    let mut tunnel = RawTunnel::register(addr).await;
    tokio::spawn(async move {
        while let Some(request) = tunnel.next_request().await {
            let text = String::from_utf8_lossy(&request).to_string();
            let path = text.split_whitespace().nth(1).unwrap_or("?").to_string();
            tunnel.respond(&ok_response(&format!("{} {}", tag, path))).await;
        }
    })
}

/// Body of a response with a single header block
pub fn body_of(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(response);
    text.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

/// Minimal local HTTP service answering `hello from <path>` on fresh connections
pub async fn start_local_service() -> (u16, JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind local service");
    let port = listener.local_addr().expect("Failed to get addr").port();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut framer = MessageFramer::new(8192);
                let mut request = BytesMut::new();
                if framer
                    .read_request(&mut socket, |c| request.extend_from_slice(&c))
                    .await
                    .is_err()
                {
                    return;
                }
                let text = String::from_utf8_lossy(&request).to_string();
                let path = text.split_whitespace().nth(1).unwrap_or("?").to_string();
                let _ = socket
                    .write_all(&ok_response(&format!("hello from {}", path)))
                    .await;
            });
        }
    });

    (port, handle)
}
