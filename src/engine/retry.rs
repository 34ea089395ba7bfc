//! 重试策略
//!
//! 延迟函数是纯函数，I/O 全部位于调用方传入的操作闭包中。

use std::time::Duration;

use bon::Builder;
use tracing::debug;

use crate::core::config::CollectorConfig;
use crate::core::error::CollectError;

#[derive(Debug, Clone, Builder)]
pub struct RetryPolicy {
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_secs(1))]
    pub base_delay: Duration,
    #[builder(default = Duration::from_secs(4))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&CollectorConfig> for RetryPolicy {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间：`min(max, base * 2^(attempt-1))`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 可判定是否值得重试的错误
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CollectError {
    fn is_retryable(&self) -> bool {
        CollectError::is_retryable(self)
    }
}

/// 放弃重试时的最终错误与已尝试次数
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

/// 按策略执行操作，直到成功、遇到不可重试错误或用尽次数
///
/// 闭包参数为当前尝试序号 (从 1 开始)。
pub async fn attempt<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, Exhausted<E>>
where
    E: Retryable + std::fmt::Display,
    F: AsyncFnMut(u32) -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;
    loop {
        match op(n).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() || n >= max_attempts => {
                return Err(Exhausted { attempts: n, error });
            }
            Err(error) => {
                let delay = policy.delay_for(n);
                debug!(attempt = n, delay_ms = delay.as_millis() as u64, "重试前等待: {}", error);
                tokio::time::sleep(delay).await;
                n += 1;
            }
        }
    }
}
