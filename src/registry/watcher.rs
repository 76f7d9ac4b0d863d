//! 服务变化监听
//!
//! 每个订阅由后端的生产者任务向有界队列推送 [`WatchEvent`]，
//! 消费方通过 [`Watcher::next`] 逐个取出。后端回调线程与消费方调度由队列解耦。

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use super::instance::WatchEvent;
use crate::error::{FlareError, Result};

/// 服务监听器
pub struct Watcher {
    service_name: String,
    rx: mpsc::Receiver<Result<WatchEvent>>,
    shutdown: CancellationToken,
}

/// 生产者一侧的句柄，由注册中心后端持有
pub struct WatchSink {
    tx: mpsc::Sender<Result<WatchEvent>>,
    shutdown: CancellationToken,
}

/// 关闭句柄
///
/// 可以克隆到其它任务中，在 `next()` 挂起期间关闭监听
#[derive(Clone)]
pub struct WatchShutdown {
    shutdown: CancellationToken,
}

impl Watcher {
    /// 创建一对 (生产者, 监听器)，队列容量为 `buffer`
    pub fn channel(service_name: impl Into<String>, buffer: usize) -> (WatchSink, Watcher) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let shutdown = CancellationToken::new();
        (
            WatchSink {
                tx,
                shutdown: shutdown.clone(),
            },
            Watcher {
                service_name: service_name.into(),
                rx,
                shutdown,
            },
        )
    }

    /// 监听的服务名
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 等待下一个事件
    ///
    /// 监听关闭（调用 `shutdown` 或生产者退出）后返回 `FlareError::WatchClosed`；
    /// 后端不可用时返回后端错误，之后的调用返回 `WatchClosed`
    pub async fn next(&mut self) -> Result<WatchEvent> {
        if self.shutdown.is_cancelled() {
            return Err(FlareError::WatchClosed);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(FlareError::WatchClosed),
            event = self.rx.recv() => match event {
                Some(Ok(event)) => Ok(event),
                Some(Err(err)) => {
                    self.shutdown.cancel();
                    Err(err)
                }
                None => Err(FlareError::WatchClosed),
            },
        }
    }

    /// 关闭监听（幂等）
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(service = %self.service_name, "watcher shutdown");
        }
        self.shutdown.cancel();
    }

    /// 获取可跨任务使用的关闭句柄
    pub fn shutdown_handle(&self) -> WatchShutdown {
        WatchShutdown {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        // 释放订阅，让生产者任务退出
        self.shutdown.cancel();
    }
}

impl WatchShutdown {
    /// 关闭监听（幂等）
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl WatchSink {
    /// 推送事件，队列满时等待
    ///
    /// 返回 `false` 表示监听已关闭，生产者应当退出
    pub async fn send(&self, event: WatchEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            sent = self.tx.send(Ok(event)) => sent.is_ok(),
        }
    }

    /// 报告后端故障并结束订阅，消费方的下一次 `next()` 收到该错误
    pub async fn fail(self, error: FlareError) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = self.tx.send(Err(error)) => {}
        }
    }

    /// 监听关闭时完成
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}
