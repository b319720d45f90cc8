/// HTTP 反向隧道代理库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod rate_limiter;
pub mod server;
pub mod socket;
pub mod stats;

// 重新导出常用类型
pub use config::{AgentConfig, AppConfig, ServerConfig};
pub use error::{BrokerError, Result};
pub use framing::{BodyFraming, FrameError, FrameSummary, MessageFramer, DEFAULT_MAX_HEADER_SIZE};
pub use rate_limiter::RateLimiter;
pub use server::{ServerDependencies, ServerState, TunnelRegistry};
pub use stats::StatsManager;
