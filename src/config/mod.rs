// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::{AgentConfigBuilder, ServerConfigBuilder};
pub use validator::ConfigValidator;

use crate::framing::DEFAULT_MAX_HEADER_SIZE;
use crate::protocol::DEFAULT_REGISTER_PATH;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "TUNNEL_BROKER_";

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 10000;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_register_path() -> String {
    DEFAULT_REGISTER_PATH.to_string()
}

fn default_tunnel_wait_ms() -> u64 {
    5000
}

fn default_health_check_interval_ms() -> u64 {
    5000
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_body_size() -> u64 {
    10 * 1024 * 1024
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_tunnels() -> usize {
    1
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_local_connect_retries() -> u32 {
    3
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量（允许短时间内的峰值连接数）
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 200,
        }
    }
}

/// 隧道连接的 TCP keepalive 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// 首次探测前的空闲时间（秒）
    pub time_secs: Option<u64>,
    /// 探测间隔（秒）
    pub interval_secs: Option<u64>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time_secs: Some(30),
            interval_secs: Some(10),
        }
    }
}

impl KeepaliveConfig {
    pub fn time(&self) -> Option<Duration> {
        self.time_secs.map(Duration::from_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

/// 代理服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口（隧道注册和客户端请求共用）
    #[serde(default = "default_port")]
    pub bind_port: u16,
    /// 隧道注册路径
    #[serde(default = "default_register_path")]
    pub register_path: String,
    /// 无可用隧道时客户端的最长等待时间（毫秒）
    #[serde(default = "default_tunnel_wait_ms")]
    pub tunnel_wait_ms: u64,
    /// 健康检查周期（毫秒）
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// HTTP 头部最大大小（字节）
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// 连接上首次读取的缓冲区大小（字节）
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// 读取完整客户端请求的最长时间（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 客户端请求体最大大小（字节），超出时返回 413
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// 隧道连接的 TCP keepalive
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    /// 统计信息 HTTP 服务器端口（可选）
    #[serde(default)]
    pub stats_port: Option<u16>,
    /// 统计信息服务器绑定地址（可选，默认使用 bind_addr）
    #[serde(default)]
    pub stats_addr: Option<String>,
    /// 速率限制配置（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_port(),
            register_path: default_register_path(),
            tunnel_wait_ms: default_tunnel_wait_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_header_size: default_max_header_size(),
            read_buffer_size: default_read_buffer_size(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_size: default_max_body_size(),
            keepalive: KeepaliveConfig::default(),
            stats_port: None,
            stats_addr: None,
            rate_limit: None,
        }
    }
}

impl ServerConfig {
    /// 创建 Builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }

    pub fn tunnel_wait(&self) -> Duration {
        Duration::from_millis(self.tunnel_wait_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 监听地址字符串
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

/// 隧道对端（agent）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 代理服务器地址
    pub server_addr: String,
    /// 代理服务器端口
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// 注册路径
    #[serde(default = "default_register_path")]
    pub register_path: String,
    /// 本地服务地址
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// 本地服务端口
    pub local_port: u16,
    /// 同时保持的隧道数量（每条隧道同一时刻只承载一个请求）
    #[serde(default = "default_tunnels")]
    pub tunnels: usize,
    /// 断线重连延迟（毫秒）- 可通过环境变量 TUNNEL_BROKER_RECONNECT_DELAY_MS 覆盖
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 本地服务连接重试次数
    #[serde(default = "default_local_connect_retries")]
    pub local_connect_retries: u32,
    /// HTTP 头部最大大小（字节）
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl AgentConfig {
    /// 创建 Builder
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_agent_config(self)
    }

    /// 重连延迟，环境变量优先
    pub fn reconnect_delay(&self) -> Duration {
        let ms = std::env::var(format!("{}RECONNECT_DELAY_MS", ENV_PREFIX))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.reconnect_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }
}

/// 应用配置
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载服务器配置（`[server]` 表）
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_server_config(&content)
    }

    /// 从字符串解析服务器配置
    pub fn parse_server_config(content: &str) -> anyhow::Result<ServerConfig> {
        #[derive(Deserialize)]
        struct ServerConfigWrapper {
            #[serde(default)]
            server: ServerConfig,
        }

        let wrapper: ServerConfigWrapper =
            toml::from_str(content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }

    /// 从文件加载隧道对端配置（`[agent]` 表）
    pub fn load_agent_config(path: &str) -> anyhow::Result<AgentConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_agent_config(&content)
    }

    /// 从字符串解析隧道对端配置
    pub fn parse_agent_config(content: &str) -> anyhow::Result<AgentConfig> {
        #[derive(Deserialize)]
        struct AgentConfigWrapper {
            agent: AgentConfig,
        }

        let wrapper: AgentConfigWrapper =
            toml::from_str(content).context("Failed to parse agent configuration")?;
        wrapper
            .agent
            .validate()
            .context("Agent configuration validation failed")?;
        Ok(wrapper.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:10000");
        assert_eq!(config.register_path, "/register");
        assert_eq!(config.tunnel_wait(), Duration::from_secs(5));
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
        assert_eq!(config.max_header_size, 8 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_server_config_uses_defaults() {
        let config = AppConfig::parse_server_config("").unwrap();
        assert_eq!(config.bind_port, DEFAULT_PORT);
        assert!(config.rate_limit.is_none());
    }

    #[test]
    fn test_toml_server_config() {
        let toml_str = r#"
            [server]
            bind_addr = "127.0.0.1"
            bind_port = 18080
            tunnel_wait_ms = 1500
            health_check_interval_ms = 250

            [server.keepalive]
            time_secs = 60

            [server.rate_limit]
            requests_per_second = 50
            burst_size = 100
        "#;

        let config = AppConfig::parse_server_config(toml_str).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:18080");
        assert_eq!(config.tunnel_wait(), Duration::from_millis(1500));
        assert_eq!(config.health_check_interval(), Duration::from_millis(250));
        assert_eq!(config.keepalive.time(), Some(Duration::from_secs(60)));
        assert_eq!(config.keepalive.interval(), None);
        assert_eq!(
            config.rate_limit,
            Some(RateLimitConfig {
                requests_per_second: 50,
                burst_size: 100
            })
        );
    }

    #[test]
    fn test_invalid_server_config_rejected() {
        let toml_str = r#"
            [server]
            register_path = "register"
        "#;
        assert!(AppConfig::parse_server_config(toml_str).is_err());
    }

    #[test]
    fn test_toml_agent_config() {
        let toml_str = r#"
            [agent]
            server_addr = "broker.example.com"
            local_port = 8080
            tunnels = 4
        "#;

        let config = AppConfig::parse_agent_config(toml_str).unwrap();
        assert_eq!(config.server_endpoint(), "broker.example.com:10000");
        assert_eq!(config.local_endpoint(), "127.0.0.1:8080");
        assert_eq!(config.tunnels, 4);
        assert_eq!(config.register_path, "/register");
        assert_eq!(config.local_connect_retries, 3);
    }

    #[test]
    fn test_agent_config_requires_section() {
        assert!(AppConfig::parse_agent_config("").is_err());
    }

    #[test]
    fn test_rate_limit_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.requests_per_second, 100);
        assert_eq!(config.burst_size, 200);
    }
}
