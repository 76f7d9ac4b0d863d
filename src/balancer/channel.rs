//! 负载均衡 Channel
//!
//! 实现 `tower::Service`，tonic 生成的客户端可以直接使用：
//! 每个请求按请求头中的亲和键选出后端 Channel 再转发。

use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::Status;
use tonic::body::Body;
use tonic::transport::Channel;
use tower::{Service, ServiceExt};

use super::picker::Picker;

/// 按请求选择后端的 Channel
#[derive(Clone)]
pub struct BalancedChannel {
    picker: Arc<Picker<Channel>>,
    pick_attempts: usize,
}

impl BalancedChannel {
    pub fn new(picker: Arc<Picker<Channel>>, pick_attempts: usize) -> Self {
        Self {
            picker,
            pick_attempts: pick_attempts.max(1),
        }
    }

    pub fn picker(&self) -> &Arc<Picker<Channel>> {
        &self.picker
    }
}

impl Service<http::Request<Body>> for BalancedChannel {
    type Response = http::Response<Body>;
    type Error = tower::BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 选择在 call 时进行，没有后端时由 call 返回 Unavailable
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let picked = self
            .picker
            .pick_with_retry(req.headers(), self.pick_attempts);

        Box::pin(async move {
            // 转成 Status，tonic 客户端会原样还原给调用方
            let channel = picked.map_err(Status::from)?;
            let response = channel.oneshot(req).await?;
            Ok(response)
        })
    }
}
