//! 服务解析任务
//!
//! 后台任务把注册中心的监听事件依次应用到连接池，并同步重建选择器。
//! 监听出错或全量同步失败时任务退出并把错误交给调用方，重连与退避由调用方决定。
//! 任务同时按固定间隔检查连接的就绪状态，有变化时刷新选择器。

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connector::Connector;
use super::picker::Picker;
use super::pool::ConnectionPool;
use crate::error::{FlareError, Result};
use crate::registry::{Registry, Watcher};

/// 服务解析器
pub struct Resolver {
    service: String,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Resolver {
    /// 打开监听、完成首次全量同步后启动后台任务
    ///
    /// 先订阅再拉取快照，两者之间发生的变化会以事件形式再次到达，重复应用是幂等的
    pub async fn spawn<K: Connector>(
        registry: Arc<dyn Registry>,
        service: &str,
        pool: Arc<ConnectionPool<K>>,
        picker: Arc<Picker<K::Connection>>,
    ) -> Result<Self> {
        let watcher = registry.watch(service).await?;
        let instances = registry.get_service(service).await?;
        pool.resync(&instances).await;
        picker.rebuild(pool.members());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            registry,
            service.to_string(),
            watcher,
            pool,
            picker,
            shutdown.clone(),
        ));

        info!(service, instances = instances.len(), "Resolver started");
        Ok(Self {
            service: service.to_string(),
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// 后台任务是否已经退出（监听关闭或出错）
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// 停止后台任务，返回任务的退出结果
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// 等待后台任务退出
    pub async fn join(mut self) -> Result<()> {
        self.wait().await
    }

    async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(FlareError::registry(format!("resolver task failed: {}", e))),
        }
    }
}

async fn run<K: Connector>(
    registry: Arc<dyn Registry>,
    service: String,
    mut watcher: Watcher,
    pool: Arc<ConnectionPool<K>>,
    picker: Arc<Picker<K::Connection>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut readiness = picker.readiness_interval().map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                watcher.shutdown();
                info!(service = %service, "Resolver stopped");
                return Ok(());
            }
            _ = tick(&mut readiness) => {
                if picker.refresh() {
                    info!(service = %service, backends = picker.snapshot().len(), "Connection readiness changed");
                }
                continue;
            }
            next = watcher.next() => next,
        };

        match next {
            Ok(event) if event.error.is_some() => {
                // 可能丢失了事件，按全量快照重新同步
                warn!(service = %service, error = ?event.error, "Watch reported an error, resyncing");
                match registry.get_service(&service).await {
                    Ok(instances) => {
                        pool.resync(&instances).await;
                        picker.rebuild(pool.members());
                    }
                    Err(e) => {
                        warn!(service = %service, error = %e, "Resync failed, resolver exiting");
                        watcher.shutdown();
                        return Err(e);
                    }
                }
            }
            Ok(event) => {
                if pool.apply(&event).await {
                    picker.rebuild(pool.members());
                }
            }
            Err(FlareError::WatchClosed) => {
                info!(service = %service, "Watch closed, resolver exiting");
                return Ok(());
            }
            Err(e) => {
                warn!(service = %service, error = %e, "Watch failed, resolver exiting");
                return Err(e);
            }
        }
    }
}

/// 等待下一次就绪检查，未开启时永不完成
async fn tick(readiness: &mut Option<Interval>) {
    match readiness {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown.cancel();
        }
    }
}
