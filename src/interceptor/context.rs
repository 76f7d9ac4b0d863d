//! 调用上下文

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FlareError, Result};
use crate::metadata::MetadataCarrier;

const GRPC_TIMEOUT: &str = "grpc-timeout";

/// 单次调用的上下文：幂等标记、截止时间和取消信号
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    idempotent: bool,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从调用元数据读取幂等标记，只认显式的 `is_idempotent: 1`
    pub fn from_metadata<M: MetadataCarrier + ?Sized>(metadata: &M) -> Self {
        Self {
            idempotent: metadata.is_idempotent(),
            ..Self::default()
        }
    }

    /// 从即将发出的请求构建上下文
    ///
    /// 幂等标记来自 metadata，截止时间来自 `grpc-timeout`（`Request::set_timeout` 写入），
    /// 取消信号来自请求扩展中的 `CancellationToken`。
    pub fn from_request<T>(request: &tonic::Request<T>) -> Self {
        let mut ctx = Self::from_metadata(request.metadata());
        if let Some(timeout) = request
            .metadata()
            .get(GRPC_TIMEOUT)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
        {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(cancel) = request.extensions().get::<CancellationToken>() {
            ctx = ctx.with_cancel(cancel.clone());
        }
        ctx
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// 绑定外部的取消信号
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 已取消返回 `Canceled`，已过截止时间返回 `DeadlineExceeded`
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FlareError::Canceled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(FlareError::DeadlineExceeded);
        }
        Ok(())
    }

    /// 等到取消或超时，返回对应的错误
    pub async fn done(&self) -> FlareError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => FlareError::Canceled,
                _ = tokio::time::sleep_until(deadline) => FlareError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                FlareError::Canceled
            }
        }
    }
}

/// 解析 `grpc-timeout`：最多 8 位数字加单位（H/M/S/m/u/n）
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
