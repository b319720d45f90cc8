/// 自定义错误类型
///
/// 核心模块（分帧、注册表、工作任务）使用精确的错误类型，
/// 启动与配置代码继续使用 anyhow
use crate::framing::FrameError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 隧道代理的主要错误类型
#[derive(Error, Debug)]
pub enum BrokerError {
    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP 消息分帧失败
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    /// 等待超时后仍无可用隧道
    #[error("No tunnel available after waiting {waited:?}")]
    NoTunnelAvailable { waited: Duration },

    /// 隧道在转发过程中失效
    #[error("Tunnel {id} lost")]
    TunnelLost { id: Uuid },

    /// 客户端未在时限内发完请求
    #[error("Request not completed within {waited:?}")]
    RequestTimeout { waited: Duration },

    /// 隧道注册握手失败
    #[error("Registration failed: {0}")]
    Registration(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// 创建无可用隧道错误
    pub fn no_tunnel(waited: Duration) -> Self {
        Self::NoTunnelAvailable { waited }
    }

    /// 创建隧道丢失错误
    pub fn tunnel_lost(id: Uuid) -> Self {
        Self::TunnelLost { id }
    }

    /// 创建注册失败错误
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 客户端请求不完整或超限，不能交给隧道
    pub fn is_rejected_request(&self) -> bool {
        match self {
            Self::RequestTimeout { .. } => true,
            Self::Framing(e) => {
                e.is_premature_close()
                    || matches!(
                        e,
                        FrameError::HeadersTooLarge { .. } | FrameError::BodyTooLarge { .. }
                    )
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tunnel_error() {
        let err = BrokerError::no_tunnel(Duration::from_secs(5));
        assert!(matches!(err, BrokerError::NoTunnelAvailable { .. }));
        assert!(!err.is_rejected_request());
        assert_eq!(err.to_string(), "No tunnel available after waiting 5s");
    }

    #[test]
    fn test_tunnel_lost_error() {
        let id = Uuid::new_v4();
        let err = BrokerError::tunnel_lost(id);
        assert!(matches!(err, BrokerError::TunnelLost { .. }));
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_framing_error_conversion() {
        let err: BrokerError = FrameError::SourceClosed.into();
        assert!(matches!(err, BrokerError::Framing(FrameError::SourceClosed)));
        assert!(err.to_string().starts_with("Framing error"));
    }

    #[test]
    fn test_rejected_requests() {
        let err: BrokerError = FrameError::IncompleteBody {
            expected: Some(10),
            received: 3,
        }
        .into();
        assert!(err.is_rejected_request());

        let err: BrokerError = FrameError::HeadersTooLarge { limit: 8192 }.into();
        assert!(err.is_rejected_request());

        let err = BrokerError::RequestTimeout {
            waited: Duration::from_millis(300),
        };
        assert!(err.is_rejected_request());
        assert_eq!(err.to_string(), "Request not completed within 300ms");

        let err: BrokerError = FrameError::BodyTooLarge { limit: 16 }.into();
        assert!(err.is_rejected_request());

        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!BrokerError::from(FrameError::Io(io_err)).is_rejected_request());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: BrokerError = io_err.into();
        assert!(matches!(err, BrokerError::Io(_)));
        assert!(!err.is_rejected_request());
    }

    #[test]
    fn test_config_and_registration_errors() {
        let err = BrokerError::config_error("bad port");
        assert!(matches!(err, BrokerError::ConfigError(_)));
        assert_eq!(err.to_string(), "Configuration error: bad port");

        let err = BrokerError::registration("unexpected status 404");
        assert_eq!(err.to_string(), "Registration failed: unexpected status 404");
    }
}
