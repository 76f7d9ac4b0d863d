use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::metadata::{IDEMPOTENT_KEY, IDEMPOTENT_VALUE};

/// 幂等标记拦截器
///
/// 给经过的每个请求加上 `is_idempotent: 1`，只应挂在幂等服务的客户端上
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyInterceptor;

impl IdempotencyInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for IdempotencyInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        mark_idempotent(&mut request);
        Ok(request)
    }
}

/// 把单个请求标记为幂等
pub fn mark_idempotent<T>(request: &mut Request<T>) {
    request
        .metadata_mut()
        .insert(IDEMPOTENT_KEY, MetadataValue::from_static(IDEMPOTENT_VALUE));
}
