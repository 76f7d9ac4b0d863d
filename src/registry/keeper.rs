//! 实例保活
//!
//! 注册后周期性调用 [`Registry::refresh`] 续期；停止续期的实例由注册中心过期摘除，
//! 本地不会主动删除。关闭时先停止续期再注销。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::instance::ServiceInstance;
use super::trait_def::Registry;
use crate::error::Result;

/// 服务保活器
pub struct Keeper {
    registry: Arc<dyn Registry>,
    instance: ServiceInstance,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Keeper {
    /// 注册实例并启动续期任务
    ///
    /// 首次注册失败直接返回错误，不启动续期
    pub async fn start(
        registry: Arc<dyn Registry>,
        instance: ServiceInstance,
        interval: Duration,
    ) -> Result<Self> {
        registry.register(instance.clone()).await?;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(refresh_loop(
            registry.clone(),
            instance.clone(),
            interval,
            shutdown.clone(),
        ));

        Ok(Self {
            registry,
            instance,
            shutdown,
            handle: Some(handle),
        })
    }

    /// 获取服务实例
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// 优雅关闭：停止续期并注销实例
    ///
    /// 应该在服务关闭前显式调用此方法，而不是依赖 Drop
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }

        match self.registry.deregister(&self.instance).await {
            Ok(()) => {
                info!(service_id = %self.instance.service_id, "Keeper stopped, service deregistered");
                Ok(())
            }
            Err(e) => {
                warn!(service_id = %self.instance.service_id, error = %e, "Failed to deregister service");
                Err(e)
            }
        }
    }
}

async fn refresh_loop(
    registry: Arc<dyn Registry>,
    instance: ServiceInstance,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // 注册刚完成，跳过立即触发的第一次 tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match registry.refresh(&instance).await {
                    Ok(()) => debug!(service_id = %instance.service_id, "Registration refreshed"),
                    // 续期失败不退出，下一个周期继续尝试
                    Err(e) => error!(service_id = %instance.service_id, error = %e, "Failed to refresh registration"),
                }
            }
        }
    }
    debug!(service_id = %instance.service_id, "Refresh task stopped");
}

impl Drop for Keeper {
    fn drop(&mut self) {
        // handle 还在说明没有调用 shutdown，只停止续期，实例交由注册中心过期
        if let Some(handle) = self.handle.take() {
            self.shutdown.cancel();
            handle.abort();
            warn!(
                service_id = %self.instance.service_id,
                "Keeper dropped without shutdown, instance will expire in the registry"
            );
        }
    }
}
