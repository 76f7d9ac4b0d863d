//! 服务注册发现模块
//!
//! 提供注册中心抽象、推送式的服务变化监听，以及实例保活

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod instance;
pub mod keeper;
pub mod memory;
pub mod trait_def;
pub mod watcher;

use std::sync::Arc;

use crate::config::RegistryConfig;
use crate::error::{FlareError, Result};
#[cfg(feature = "consul")]
pub use consul::ConsulRegistry;
#[cfg(feature = "etcd")]
pub use etcd::EtcdRegistry;
pub use instance::{ServiceInstance, WatchAction, WatchEvent};
pub use keeper::Keeper;
pub use memory::MemoryRegistry;
pub use trait_def::Registry;
pub use watcher::{WatchShutdown, WatchSink, Watcher};

/// 注册中心类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryType {
    Etcd,
    Consul,
    Memory,
}

impl std::str::FromStr for RegistryType {
    type Err = FlareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "etcd" => Ok(RegistryType::Etcd),
            "consul" => Ok(RegistryType::Consul),
            "memory" | "mem" => Ok(RegistryType::Memory),
            _ => Err(FlareError::config(format!("Unknown registry type: {}", s))),
        }
    }
}

/// 创建注册中心实例
pub async fn create_registry(config: &RegistryConfig) -> Result<Arc<dyn Registry>> {
    match config.registry_type.parse::<RegistryType>()? {
        #[cfg(feature = "etcd")]
        RegistryType::Etcd => Ok(Arc::new(EtcdRegistry::new(config).await?)),
        #[cfg(not(feature = "etcd"))]
        RegistryType::Etcd => Err(FlareError::config(
            "etcd registry requires the `etcd` feature",
        )),
        #[cfg(feature = "consul")]
        RegistryType::Consul => Ok(Arc::new(ConsulRegistry::new(config)?)),
        #[cfg(not(feature = "consul"))]
        RegistryType::Consul => Err(FlareError::config(
            "consul registry requires the `consul` feature",
        )),
        RegistryType::Memory => Ok(Arc::new(MemoryRegistry::from_config(config))),
    }
}
