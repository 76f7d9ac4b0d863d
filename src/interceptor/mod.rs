//! gRPC 拦截器模块
//!
//! 提供幂等标记和重试拦截器

pub mod context;
pub mod idempotency;
pub mod retry;

pub use context::CallContext;
pub use idempotency::{IdempotencyInterceptor, mark_idempotent};
pub use retry::RetryInterceptor;
