//! 服务注册发现 Trait 定义

use async_trait::async_trait;

use super::instance::ServiceInstance;
use super::watcher::Watcher;
use crate::error::Result;

/// 服务注册发现 Trait
///
/// 注册中心的错误原样返回给调用方，实现内部不做重试或重连
#[async_trait]
pub trait Registry: Send + Sync {
    /// 注册服务实例
    ///
    /// 幂等：同一个 `service_id` 再次注册会替换旧实例
    async fn register(&self, instance: ServiceInstance) -> Result<()>;

    /// 注销服务实例
    ///
    /// 幂等：实例不存在时不报错
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;

    /// 获取服务的所有实例（时间点快照）
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// 监听服务变化
    async fn watch(&self, name: &str) -> Result<Watcher>;

    /// 续期实例的存活状态
    ///
    /// 默认实现是重新注册；基于租约的后端应当改为续租
    async fn refresh(&self, instance: &ServiceInstance) -> Result<()> {
        self.register(instance.clone()).await
    }
}
