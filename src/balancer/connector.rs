//! 连接工厂
//!
//! 负载均衡只依赖两个能力：按地址建立连接，以及查询连接是否就绪。

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{FlareError, Result};

/// 连接句柄
pub trait Connection: Clone + Send + Sync + 'static {
    /// 就绪信号，只有就绪的连接参与负载均衡
    fn is_ready(&self) -> bool {
        true
    }
}

/// 连接工厂
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// 建立到 `address`（host:port）的连接
    async fn connect(&self, address: &str) -> Result<Self::Connection>;
}

/// tonic Channel 在首次请求时才真正建连，创建后即视为就绪
impl Connection for Channel {}

/// 基于 tonic 的连接工厂
#[derive(Debug, Clone, Default)]
pub struct TonicConnector {
    config: ClientConfig,
}

impl TonicConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TonicConnector {
    type Connection = Channel;

    async fn connect(&self, address: &str) -> Result<Channel> {
        let mut endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| FlareError::connection(format!("Invalid address {}: {}", address, e)))?
            .connect_timeout(self.config.connect_timeout());

        if let Some(timeout) = self.config.timeout() {
            endpoint = endpoint.timeout(timeout);
        }

        debug!(address, "Creating lazy channel");
        Ok(endpoint.connect_lazy())
    }
}
