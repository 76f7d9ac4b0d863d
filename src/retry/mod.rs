//! 重试策略模块
//!
//! 策略只回答两个问题：一个错误能否重试，以及下一次尝试前等待多久。
//! 是否进入重试循环由调用的幂等标记决定，见 [`crate::interceptor::RetryInterceptor`]。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoff;
pub use fixed::{FixedBackoff, NoBackoff};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackoffConfig, RetryConfig};
use crate::error::{Classify, ErrorKind};

/// 退避 trait
pub trait Backoff: Send + Sync {
    /// 第 `attempt` 次尝试（从 1 开始）失败后的等待时间
    fn delay(&self, attempt: usize) -> Duration;
}

impl From<&BackoffConfig> for Arc<dyn Backoff> {
    fn from(config: &BackoffConfig) -> Self {
        match *config {
            BackoffConfig::None => Arc::new(NoBackoff),
            BackoffConfig::Fixed { delay_ms } => {
                Arc::new(FixedBackoff::new(Duration::from_millis(delay_ms)))
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => Arc::new(ExponentialBackoff::new(
                Duration::from_millis(base_delay_ms),
                Duration::from_millis(max_delay_ms),
            )),
        }
    }
}

/// 重试策略
#[derive(Clone)]
pub struct RetryPolicy {
    retryable_status_codes: HashSet<i32>,
    retryable_error_kinds: HashSet<ErrorKind>,
    max_attempts: usize,
    backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            retryable_status_codes: HashSet::new(),
            retryable_error_kinds: HashSet::new(),
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(NoBackoff),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            retryable_status_codes: config.retryable_status_codes.iter().copied().collect(),
            retryable_error_kinds: config.retryable_error_kinds.iter().copied().collect(),
            max_attempts: config.max_attempts.max(1),
            backoff: (&config.backoff).into(),
        }
    }

    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = tonic::Code>) -> Self {
        self.retryable_status_codes
            .extend(codes.into_iter().map(|code| code as i32));
        self
    }

    pub fn with_error_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_error_kinds.extend(kinds);
        self
    }

    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// 状态码或错误类别任一命中即可重试
    pub fn is_retryable<E: Classify + ?Sized>(&self, error: &E) -> bool {
        let by_code = error
            .status_code()
            .is_some_and(|code| self.retryable_status_codes.contains(&code));
        let by_kind = error
            .error_kind()
            .is_some_and(|kind| self.retryable_error_kinds.contains(&kind));
        by_code || by_kind
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self, attempt: usize) -> Duration {
        self.backoff.delay(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retryable_error_kinds", &self.retryable_error_kinds)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
