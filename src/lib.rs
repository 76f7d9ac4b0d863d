//! Flare Client Core Library
//!
//! Provides client-side service discovery, consistent-hash load balancing and
//! idempotency-gated retry for gRPC calls.

pub mod config;
pub mod error;
pub mod metadata;

// 服务注册发现
pub mod registry;

// 客户端负载均衡
pub mod balancer;

// 重试与拦截器
pub mod interceptor;
pub mod retry;

// Re-exports
pub use config::{
    BackoffConfig, BalancerConfig, ClientConfig, Config, RegistryConfig, RetryConfig,
};
pub use error::{Classify, ErrorKind, FlareError, InfraResult, InfraResultExt, Result};
pub use metadata::{IDEMPOTENT_KEY, IDEMPOTENT_VALUE, MetadataCarrier};

pub use registry::{
    Keeper, MemoryRegistry, Registry, RegistryType, ServiceInstance, WatchAction, WatchEvent,
    WatchShutdown, Watcher, create_registry,
};
#[cfg(feature = "etcd")]
pub use registry::EtcdRegistry;
#[cfg(feature = "consul")]
pub use registry::ConsulRegistry;

pub use balancer::{
    BalancedChannel, Balancer, Connection, ConnectionPool, Connector, HashRing, Picker,
    PickerState, Resolver, TonicConnector,
};

pub use interceptor::{CallContext, IdempotencyInterceptor, RetryInterceptor, mark_idempotent};
pub use retry::{Backoff, ExponentialBackoff, FixedBackoff, NoBackoff, RetryPolicy};
