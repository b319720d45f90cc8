use anyhow::{Context, Result};

use super::{
    validator::ConfigValidator, AgentConfig, KeepaliveConfig, RateLimitConfig, ServerConfig,
};

/// ServerConfig Builder
///
/// 未设置的字段使用 `ServerConfig::default()` 的值。
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    register_path: Option<String>,
    tunnel_wait_ms: Option<u64>,
    health_check_interval_ms: Option<u64>,
    max_header_size: Option<usize>,
    read_buffer_size: Option<usize>,
    request_timeout_ms: Option<u64>,
    max_body_size: Option<u64>,
    keepalive: Option<KeepaliveConfig>,
    stats_port: Option<u16>,
    stats_addr: Option<String>,
    rate_limit: Option<RateLimitConfig>,
}

impl ServerConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// 设置绑定端口
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// 设置注册路径
    pub fn register_path(mut self, path: impl Into<String>) -> Self {
        self.register_path = Some(path.into());
        self
    }

    /// 设置无隧道时的等待时间
    pub fn tunnel_wait_ms(mut self, ms: u64) -> Self {
        self.tunnel_wait_ms = Some(ms);
        self
    }

    /// 设置健康检查周期
    pub fn health_check_interval_ms(mut self, ms: u64) -> Self {
        self.health_check_interval_ms = Some(ms);
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = Some(size);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    /// 设置读取完整请求的超时
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    pub fn max_body_size(mut self, size: u64) -> Self {
        self.max_body_size = Some(size);
        self
    }

    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// 设置统计端口
    pub fn stats_port(mut self, port: u16) -> Self {
        self.stats_port = Some(port);
        self
    }

    /// 设置统计地址
    pub fn stats_addr(mut self, addr: impl Into<String>) -> Self {
        self.stats_addr = Some(addr.into());
        self
    }

    /// 设置速率限制
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// 构建 ServerConfig 并验证
    pub fn build(self) -> Result<ServerConfig> {
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            bind_addr: self.bind_addr.unwrap_or(defaults.bind_addr),
            bind_port: self.bind_port.unwrap_or(defaults.bind_port),
            register_path: self.register_path.unwrap_or(defaults.register_path),
            tunnel_wait_ms: self.tunnel_wait_ms.unwrap_or(defaults.tunnel_wait_ms),
            health_check_interval_ms: self
                .health_check_interval_ms
                .unwrap_or(defaults.health_check_interval_ms),
            max_header_size: self.max_header_size.unwrap_or(defaults.max_header_size),
            read_buffer_size: self.read_buffer_size.unwrap_or(defaults.read_buffer_size),
            request_timeout_ms: self
                .request_timeout_ms
                .unwrap_or(defaults.request_timeout_ms),
            max_body_size: self.max_body_size.unwrap_or(defaults.max_body_size),
            keepalive: self.keepalive.unwrap_or(defaults.keepalive),
            stats_port: self.stats_port,
            stats_addr: self.stats_addr,
            rate_limit: self.rate_limit,
        };

        // 验证配置
        ConfigValidator::validate_server_config(&config)?;

        Ok(config)
    }
}

/// AgentConfig Builder
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    server_addr: Option<String>,
    server_port: Option<u16>,
    register_path: Option<String>,
    local_addr: Option<String>,
    local_port: Option<u16>,
    tunnels: Option<usize>,
    reconnect_delay_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    local_connect_retries: Option<u32>,
    max_header_size: Option<usize>,
}

impl AgentConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置服务器地址
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    /// 设置服务器端口
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    pub fn register_path(mut self, path: impl Into<String>) -> Self {
        self.register_path = Some(path.into());
        self
    }

    /// 设置本地服务地址
    pub fn local_addr(mut self, addr: impl Into<String>) -> Self {
        self.local_addr = Some(addr.into());
        self
    }

    /// 设置本地服务端口
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// 设置隧道数量
    pub fn tunnels(mut self, count: usize) -> Self {
        self.tunnels = Some(count);
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_delay_ms = Some(ms);
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    pub fn local_connect_retries(mut self, retries: u32) -> Self {
        self.local_connect_retries = Some(retries);
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = Some(size);
        self
    }

    /// 构建 AgentConfig 并验证
    pub fn build(self) -> Result<AgentConfig> {
        let config = AgentConfig {
            server_addr: self.server_addr.context("server_addr is required")?,
            server_port: self.server_port.unwrap_or_else(super::default_port),
            register_path: self
                .register_path
                .unwrap_or_else(super::default_register_path),
            local_addr: self.local_addr.unwrap_or_else(super::default_local_addr),
            local_port: self.local_port.context("local_port is required")?,
            tunnels: self.tunnels.unwrap_or_else(super::default_tunnels),
            reconnect_delay_ms: self
                .reconnect_delay_ms
                .unwrap_or_else(super::default_reconnect_delay_ms),
            connect_timeout_ms: self
                .connect_timeout_ms
                .unwrap_or_else(super::default_connect_timeout_ms),
            local_connect_retries: self
                .local_connect_retries
                .unwrap_or_else(super::default_local_connect_retries),
            max_header_size: self
                .max_header_size
                .unwrap_or_else(super::default_max_header_size),
        };

        ConfigValidator::validate_agent_config(&config)?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_builder_defaults() {
        let config = ServerConfigBuilder::new().build().unwrap();
        assert_eq!(config.bind_port, 10000);
        assert_eq!(config.register_path, "/register");
    }

    #[test]
    fn test_server_builder_overrides() {
        let config = ServerConfigBuilder::new()
            .bind_addr("127.0.0.1")
            .bind_port(18000)
            .tunnel_wait_ms(200)
            .health_check_interval_ms(100)
            .rate_limit(RateLimitConfig {
                requests_per_second: 10,
                burst_size: 20,
            })
            .build()
            .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:18000");
        assert_eq!(config.tunnel_wait_ms, 200);
        assert_eq!(config.health_check_interval_ms, 100);
        assert!(config.rate_limit.is_some());
    }

    #[test]
    fn test_server_builder_validates() {
        assert!(ServerConfigBuilder::new().register_path("nope").build().is_err());
        assert!(ServerConfigBuilder::new().tunnel_wait_ms(0).build().is_err());
    }

    #[test]
    fn test_agent_builder_requires_fields() {
        assert!(AgentConfigBuilder::new().local_port(8080).build().is_err());
        assert!(AgentConfigBuilder::new().server_addr("127.0.0.1").build().is_err());

        let config = AgentConfigBuilder::new()
            .server_addr("127.0.0.1")
            .local_port(8080)
            .tunnels(3)
            .build()
            .unwrap();
        assert_eq!(config.tunnels, 3);
        assert_eq!(config.server_port, 10000);
        assert_eq!(config.local_addr, "127.0.0.1");
    }
}
