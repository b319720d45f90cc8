/// 入站连接速率限制
///
/// 使用 token bucket 算法限制每秒接受的新连接数，超出的连接直接关闭
use crate::config::RateLimitConfig;
use crate::error::{BrokerError, Result};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 速率限制器（克隆后共享同一个令牌桶）
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// 根据配置创建速率限制器
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let per_second = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
            BrokerError::config_error("rate_limit.requests_per_second must be greater than 0")
        })?;
        let burst = NonZeroU32::new(config.burst_size).ok_or_else(|| {
            BrokerError::config_error("rate_limit.burst_size must be greater than 0")
        })?;

        let quota = Quota::per_second(per_second).allow_burst(burst);

        Ok(Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            config: config.clone(),
        })
    }

    /// 尝试为一个新连接获取令牌
    ///
    /// 被限流时返回下一个令牌可用前需要等待的时间
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        self.inner
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
