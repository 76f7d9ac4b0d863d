//! 客户端负载均衡模块
//!
//! 注册中心事件 → 连接池 → 一致性哈希选择器 → 每次调用 `pick()`

pub mod channel;
pub mod connector;
pub mod picker;
pub mod pool;
pub mod resolver;
pub mod ring;

pub use channel::BalancedChannel;
pub use connector::{Connection, Connector, TonicConnector};
pub use picker::{Picker, PickerState};
pub use pool::ConnectionPool;
pub use resolver::Resolver;
pub use ring::{HashRing, RingNode};

use std::sync::Arc;
use tonic::transport::Channel;

use crate::config::BalancerConfig;
use crate::error::Result;
use crate::metadata::MetadataCarrier;
use crate::registry::Registry;

/// 单个服务的负载均衡器：连接池、选择器和解析任务的组合
pub struct Balancer<K: Connector> {
    pool: Arc<ConnectionPool<K>>,
    picker: Arc<Picker<K::Connection>>,
    resolver: Resolver,
    pick_attempts: usize,
}

impl<K: Connector> Balancer<K> {
    /// 订阅服务并完成首次同步
    pub async fn start(
        registry: Arc<dyn Registry>,
        service: &str,
        connector: K,
        config: &BalancerConfig,
    ) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(connector));
        let picker = Arc::new(Picker::new(service, config));
        let resolver = Resolver::spawn(registry, service, pool.clone(), picker.clone()).await?;

        Ok(Self {
            pool,
            picker,
            resolver,
            pick_attempts: config.pick_attempts.max(1),
        })
    }

    /// 为一次调用选择连接，选中失效连接时刷新快照后自动重选
    pub fn pick<M>(&self, metadata: &M) -> Result<K::Connection>
    where
        M: MetadataCarrier + ?Sized,
    {
        self.picker.pick_with_retry(metadata, self.pick_attempts)
    }

    pub fn picker(&self) -> &Arc<Picker<K::Connection>> {
        &self.picker
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<K>> {
        &self.pool
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// 停止解析任务，连接随池一起释放
    pub async fn shutdown(self) -> Result<()> {
        self.resolver.shutdown().await
    }
}

impl<K: Connector<Connection = Channel>> Balancer<K> {
    /// 供 tonic 客户端使用的 Channel
    pub fn channel(&self) -> BalancedChannel {
        BalancedChannel::new(self.picker.clone(), self.pick_attempts)
    }
}
