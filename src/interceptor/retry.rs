//! 重试拦截器
//!
//! 只有显式标记为幂等的调用才会进入重试循环，非幂等调用恰好执行一次。
//! 每次发起调用、每次退避等待都与取消/超时竞争。

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tracing::{debug, warn};

use super::context::CallContext;
use crate::config::RetryConfig;
use crate::error::{Classify, FlareError};
use crate::retry::RetryPolicy;

/// 重试拦截器
#[derive(Debug, Clone, Default)]
pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(RetryPolicy::from_config(config))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行一元调用
    ///
    /// `call` 每次尝试调用一次。返回的错误要么是某次尝试的原始错误，
    /// 要么是上下文错误（`Canceled` / `DeadlineExceeded`）转换成的 `E`。
    pub async fn unary<T, E, F, Fut>(&self, ctx: &CallContext, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<FlareError>,
    {
        if !ctx.is_idempotent() {
            ctx.check()?;
            return dispatch(ctx, call()).await;
        }

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check()?;

            let err = match dispatch(ctx, call()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                debug!(
                    attempt,
                    code = ?err.status_code(),
                    kind = ?err.error_kind(),
                    "Error is not retryable"
                );
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(
                    attempt,
                    code = ?err.status_code(),
                    kind = ?err.error_kind(),
                    "Retry attempts exhausted"
                );
                return Err(err);
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = ?err.status_code(),
                kind = ?err.error_kind(),
                "Retrying idempotent call"
            );
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    reason = ctx.done() => return Err(reason.into()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// 执行一元调用，上下文取自请求本身
    ///
    /// 幂等标记、截止时间和取消信号都从 `request` 读取（见 [`CallContext::from_request`]），
    /// 与真正发出的请求保持一致。每次尝试用消息和 metadata 的副本重新构建请求，
    /// 扩展中只保留取消信号。
    pub async fn unary_request<Req, T, E, F, Fut>(
        &self,
        request: Request<Req>,
        mut call: F,
    ) -> Result<T, E>
    where
        Req: Clone,
        F: FnMut(Request<Req>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<FlareError>,
    {
        let ctx = CallContext::from_request(&request);
        let metadata = request.metadata().clone();
        let message = request.into_inner();

        self.unary(&ctx, || {
            let mut attempt = Request::new(message.clone());
            *attempt.metadata_mut() = metadata.clone();
            attempt
                .extensions_mut()
                .insert::<CancellationToken>(ctx.cancel_token().clone());
            call(attempt)
        })
        .await
    }

    /// 流式调用不重试，只做一次带取消检查的打开
    pub async fn stream<T, E, F, Fut>(&self, ctx: &CallContext, open: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<FlareError>,
    {
        ctx.check()?;
        dispatch(ctx, open()).await
    }
}

async fn dispatch<T, E, Fut>(ctx: &CallContext, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<FlareError>,
{
    tokio::select! {
        biased;
        reason = ctx.done() => Err(reason.into()),
        result = fut => result,
    }
}
