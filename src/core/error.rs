//! 错误处理体系 (Error Handling System)
//!
//! 定义采集链路的错误分类、阻断原因以及全局 Result 别名。
//! 分类决定两件事：是否在关键词生命周期内重试，以及是否计入隧道健康度。

use reqwest::StatusCode;
use thiserror::Error;

/// 出口阻断原因 (Block Reasons)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// 触发 403 静态拦截
    IpBlocked,
    /// 触发 429 速率限制
    RateLimit,
    /// 其他可识别的阻断
    Custom(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::IpBlocked => write!(f, "IpBlocked(403)"),
            BlockReason::RateLimit => write!(f, "RateLimit(429)"),
            BlockReason::Custom(s) => write!(f, "Custom({})", s),
        }
    }
}

impl From<StatusCode> for BlockReason {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::FORBIDDEN => Self::IpBlocked,
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimit,
            _ => Self::Custom(format!("HTTP {}", code)),
        }
    }
}

/// 采集域错误 (Collection Domain Errors)
#[derive(Error, Debug)]
pub enum CollectError {
    /// 隧道建立失败、连接被拒绝或请求在传输层中断
    #[error("Tunnel connection error: {0}")]
    TunnelConnection(String),

    #[error("Fetch timed out after {0}s")]
    FetchTimeout(u64),

    /// 出口被目标站点识别并拦截
    #[error("Blocked by upstream: {0}")]
    Blocked(BlockReason),

    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// 响应内容无法解析（同意页、验证码页、结构变更等）
    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Dedup cache error: {0}")]
    Cache(String),

    /// 当前实例已无可用出口，本轮运行提前结束
    #[error("Tunnel pool exhausted: {0}")]
    TunnelExhausted(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// 全局 Result 别名
pub type Result<T> = std::result::Result<T, CollectError>;

impl CollectError {
    /// 是否允许在同一次关键词尝试内重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectError::TunnelConnection(_)
                | CollectError::FetchTimeout(_)
                | CollectError::Blocked(_)
                | CollectError::HttpStatus(_)
                | CollectError::Parse(_)
                | CollectError::Persistence(_)
                | CollectError::Cache(_)
        )
    }

    /// 是否应计入当前隧道的失败次数
    ///
    /// 内容类错误（解析失败）与出口无关，不惩罚隧道。
    pub fn penalizes_tunnel(&self) -> bool {
        matches!(
            self,
            CollectError::TunnelConnection(_)
                | CollectError::FetchTimeout(_)
                | CollectError::Blocked(_)
                | CollectError::HttpStatus(_)
        )
    }

    /// 是否终止整轮运行
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CollectError::TunnelExhausted(_) | CollectError::Cancelled(_)
        )
    }

    /// 将底层网络错误映射到采集分类
    pub fn from_transport(err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            CollectError::FetchTimeout(timeout_secs)
        } else if let Some(status) = err.status() {
            CollectError::from_status(status)
        } else {
            CollectError::TunnelConnection(err.to_string())
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                CollectError::Blocked(BlockReason::from(status))
            }
            other => CollectError::HttpStatus(other.as_u16()),
        }
    }

    /// 从中间件错误中分层解包 (Downcasting)
    pub fn from_middleware(err: reqwest_middleware::Error, timeout_secs: u64) -> Self {
        match err {
            reqwest_middleware::Error::Middleware(anyhow_err) => {
                match anyhow_err.downcast::<CollectError>() {
                    Ok(inner) => inner,
                    Err(other) => CollectError::TunnelConnection(other.to_string()),
                }
            }
            reqwest_middleware::Error::Reqwest(e) => CollectError::from_transport(&e, timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_retry_without_penalizing_tunnel() {
        let err = CollectError::Parse("ytInitialData not found".into());
        assert!(err.is_retryable());
        assert!(!err.penalizes_tunnel());
        assert!(!err.is_fatal());
    }

    #[test]
    fn transport_errors_penalize_tunnel() {
        for err in [
            CollectError::TunnelConnection("refused".into()),
            CollectError::FetchTimeout(30),
            CollectError::Blocked(BlockReason::RateLimit),
            CollectError::HttpStatus(503),
        ] {
            assert!(err.is_retryable(), "{err}");
            assert!(err.penalizes_tunnel(), "{err}");
        }
    }

    #[test]
    fn exhaustion_is_fatal_and_not_retried() {
        let err = CollectError::TunnelExhausted("all endpoints cooling down".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn blocking_statuses_map_to_block_reasons() {
        assert!(matches!(
            CollectError::from_status(StatusCode::FORBIDDEN),
            CollectError::Blocked(BlockReason::IpBlocked)
        ));
        assert!(matches!(
            CollectError::from_status(StatusCode::TOO_MANY_REQUESTS),
            CollectError::Blocked(BlockReason::RateLimit)
        ));
        assert!(matches!(
            CollectError::from_status(StatusCode::BAD_GATEWAY),
            CollectError::HttpStatus(502)
        ));
    }

    #[test]
    fn middleware_errors_are_unwrapped() {
        let wrapped = reqwest_middleware::Error::Middleware(anyhow::Error::new(
            CollectError::Blocked(BlockReason::IpBlocked),
        ));
        assert!(matches!(
            CollectError::from_middleware(wrapped, 30),
            CollectError::Blocked(BlockReason::IpBlocked)
        ));
    }
}
