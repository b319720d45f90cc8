use anyhow::{bail, Result};
use tracing::warn;

use super::{AgentConfig, RateLimitConfig, ServerConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证注册路径
    pub fn validate_register_path(path: &str, context: &str) -> Result<()> {
        if !path.starts_with('/') {
            bail!("{}: register_path must start with '/' (got '{}')", context, path);
        }
        if path.chars().any(char::is_whitespace) {
            bail!("{}: register_path cannot contain whitespace", context);
        }
        Ok(())
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        // bind_port 为 0 时由系统分配端口
        Self::validate_address(&config.bind_addr, "Server bind_addr")?;
        Self::validate_register_path(&config.register_path, "Server")?;

        if config.tunnel_wait_ms == 0 {
            bail!("tunnel_wait_ms must be greater than 0");
        }
        if config.health_check_interval_ms == 0 {
            bail!("health_check_interval_ms must be greater than 0");
        }
        if config.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be greater than 0");
        }
        if config.max_header_size < 256 {
            bail!(
                "max_header_size must be at least 256 bytes (got {})",
                config.max_header_size
            );
        }
        if config.max_body_size == 0 {
            bail!("max_body_size must be greater than 0");
        }
        if config.read_buffer_size == 0 {
            bail!("read_buffer_size must be greater than 0");
        }
        if config.read_buffer_size > config.max_header_size {
            bail!(
                "read_buffer_size ({}) cannot be greater than max_header_size ({})",
                config.read_buffer_size,
                config.max_header_size
            );
        }

        if let Some(ref addr) = config.stats_addr {
            Self::validate_address(addr, "Server stats_addr")?;
        }
        if let Some(port) = config.stats_port {
            Self::validate_port(port, "Server stats_port")?;
            if port == config.bind_port {
                bail!("stats_port cannot be the same as bind_port ({})", port);
            }
        }

        if let Some(ref rate_limit) = config.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }

        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }

    /// 验证隧道对端配置
    pub fn validate_agent_config(config: &AgentConfig) -> Result<()> {
        Self::validate_address(&config.server_addr, "Agent server_addr")?;
        Self::validate_port(config.server_port, "Agent server_port")?;
        Self::validate_address(&config.local_addr, "Agent local_addr")?;
        Self::validate_port(config.local_port, "Agent local_port")?;
        Self::validate_register_path(&config.register_path, "Agent")?;

        if config.tunnels == 0 {
            bail!("tunnels must be at least 1");
        }
        if config.tunnels > 64 {
            warn!(
                "tunnels is set to {}, each tunnel holds an idle connection on the broker",
                config.tunnels
            );
        }
        if config.connect_timeout_ms == 0 {
            bail!("connect_timeout_ms must be greater than 0");
        }
        if config.max_header_size < 256 {
            bail!(
                "max_header_size must be at least 256 bytes (got {})",
                config.max_header_size
            );
        }

        Ok(())
    }
}
