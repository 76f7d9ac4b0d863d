//! 进程内注册中心
//!
//! 适用于测试和单进程部署。可选 TTL：未在 TTL 内续期的实例由后台清理任务摘除，
//! 与真实注册中心的过期语义一致。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::instance::{ServiceInstance, WatchAction, WatchEvent};
use super::trait_def::Registry;
use super::watcher::Watcher;
use crate::config::RegistryConfig;
use crate::error::{FlareError, Result};

const EVENT_CAPACITY: usize = 1024;

/// 进程内注册中心
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    /// service_name -> service_id -> entry
    services: Mutex<HashMap<String, HashMap<String, Entry>>>,
    events: broadcast::Sender<(String, WatchEvent)>,
    ttl: Option<Duration>,
    watch_buffer: usize,
}

struct Entry {
    instance: ServiceInstance,
    expires_at: Option<Instant>,
}

impl MemoryRegistry {
    /// 创建不带过期的注册中心
    pub fn new() -> Self {
        Self::build(None, 64)
    }

    /// 创建带 TTL 的注册中心，需要在 tokio 运行时内调用
    pub fn with_ttl(ttl: Duration) -> Self {
        let registry = Self::build(Some(ttl), 64);
        registry.start_reaper(ttl);
        registry
    }

    /// 从配置创建，`ttl = 0` 表示不过期
    pub fn from_config(config: &RegistryConfig) -> Self {
        let ttl = (config.ttl > 0).then(|| config.ttl());
        let registry = Self::build(ttl, config.watch_buffer);
        if let Some(ttl) = ttl {
            registry.start_reaper(ttl);
        }
        registry
    }

    fn build(ttl: Option<Duration>, watch_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                services: Mutex::new(HashMap::new()),
                events,
                ttl,
                watch_buffer,
            }),
        }
    }

    fn start_reaper(&self, ttl: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = (ttl / 2).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                MemoryRegistry { inner }.expire_stale();
            }
            debug!("memory registry reaper stopped");
        });
    }

    /// 摘除所有已过期的实例，返回被摘除的数量
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let mut expired: Vec<(String, ServiceInstance)> = Vec::new();
        let mut services = self.lock();
        for (name, instances) in services.iter_mut() {
            instances.retain(|_, entry| match entry.expires_at {
                Some(deadline) if deadline <= now => {
                    expired.push((name.clone(), entry.instance.clone()));
                    false
                }
                _ => true,
            });
        }
        services.retain(|_, instances| !instances.is_empty());

        // 持锁发布，事件顺序与状态变化顺序一致
        let count = expired.len();
        for (name, instance) in expired {
            info!(
                service = %name,
                service_id = %instance.service_id,
                "Service instance expired"
            );
            self.publish(name, WatchEvent::remove(vec![instance]));
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Entry>>> {
        // 锁内不会 panic，中毒时直接沿用数据
        self.inner
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 必须在持有 `services` 锁时调用；broadcast 发送是同步的，不会阻塞
    fn publish(&self, name: String, event: WatchEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.inner.events.send((name, event));
    }

    fn expiry(&self) -> Option<Instant> {
        self.inner.ttl.map(|ttl| Instant::now() + ttl)
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let name = instance.service_name.clone();
        let mut services = self.lock();
        let previous = services.entry(name.clone()).or_default().insert(
            instance.service_id.clone(),
            Entry {
                instance: instance.clone(),
                expires_at: self.expiry(),
            },
        );
        let action = if previous.is_some() {
            WatchAction::Update
        } else {
            WatchAction::Add
        };

        info!(
            service = %name,
            service_id = %instance.service_id,
            address = %instance.address,
            ?action,
            "Service registered"
        );
        self.publish(name, WatchEvent::new(action, vec![instance]));
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let mut services = self.lock();
        let removed = services
            .get_mut(&instance.service_name)
            .and_then(|instances| instances.remove(&instance.service_id));
        if services
            .get(&instance.service_name)
            .is_some_and(|instances| instances.is_empty())
        {
            services.remove(&instance.service_name);
        }

        if let Some(entry) = removed {
            info!(
                service = %instance.service_name,
                service_id = %instance.service_id,
                "Service deregistered"
            );
            self.publish(
                instance.service_name.clone(),
                WatchEvent::remove(vec![entry.instance]),
            );
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let services = self.lock();
        let mut instances: Vec<ServiceInstance> = services
            .get(name)
            .map(|instances| instances.values().map(|e| e.instance.clone()).collect())
            .unwrap_or_default();
        instances.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(instances)
    }

    async fn watch(&self, name: &str) -> Result<Watcher> {
        // 先订阅再返回，调用 watch 之后发生的变化都不会丢
        let mut rx = self.inner.events.subscribe();
        let (sink, watcher) = Watcher::channel(name, self.inner.watch_buffer);
        let service = name.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = sink.closed() => break,
                    message = rx.recv() => message,
                };

                let event = match message {
                    Ok((name, event)) if name == service => event,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(service = %service, skipped, "watch lagged, consumer should resync");
                        WatchEvent::error(
                            WatchAction::Update,
                            FlareError::registry(format!("watch lagged by {} events", skipped)),
                        )
                    }
                    Err(RecvError::Closed) => break,
                };

                if !sink.send(event).await {
                    break;
                }
            }
            debug!(service = %service, "memory watch producer stopped");
        });

        debug!(service = %name, "watch opened");
        Ok(watcher)
    }

    async fn refresh(&self, instance: &ServiceInstance) -> Result<()> {
        let refreshed = {
            let mut services = self.lock();
            match services
                .get_mut(&instance.service_name)
                .and_then(|instances| instances.get_mut(&instance.service_id))
            {
                Some(entry) if entry.instance == *instance => {
                    entry.expires_at = self.expiry();
                    true
                }
                _ => false,
            }
        };

        if refreshed {
            Ok(())
        } else {
            // 已过期或内容变化，重新注册
            self.register(instance.clone()).await
        }
    }
}
