//! etcd 服务注册发现实现
//!
//! 键格式：`/{namespace}/services/{service_name}/{service_id}`，值为实例的 JSON。
//! 每个实例绑定一个 TTL 租约，续期通过租约 keep-alive 完成。

use async_trait::async_trait;
use etcd_client::{Client, Event, EventType, GetOptions, KeyValue, PutOptions, WatchOptions};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::instance::{ServiceInstance, WatchAction, WatchEvent};
use super::trait_def::Registry;
use super::watcher::Watcher;
use crate::config::RegistryConfig;
use crate::error::{FlareError, Result};

/// etcd 服务注册发现
pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    ttl: i64,
    watch_buffer: usize,
    /// key -> lease id
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdRegistry {
    pub async fn new(config: &RegistryConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(FlareError::config("etcd endpoints not configured"));
        }

        let client = Client::connect(config.endpoints.clone(), None)
            .await
            .map_err(|e| FlareError::registry(format!("Failed to connect to etcd: {}", e)))?;

        info!(endpoints = ?config.endpoints, namespace = %config.namespace, "Connected to etcd");

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            ttl: config.ttl.max(1) as i64,
            watch_buffer: config.watch_buffer,
            leases: Mutex::new(HashMap::new()),
        })
    }

    fn service_prefix(&self, service_name: &str) -> String {
        format!("/{}/services/{}/", self.namespace, service_name)
    }

    fn instance_key(&self, instance: &ServiceInstance) -> String {
        format!(
            "{}{}",
            self.service_prefix(&instance.service_name),
            instance.service_id
        )
    }

    fn cached_lease(&self, key: &str) -> Option<i64> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
    }

    fn cache_lease(&self, key: String, lease_id: i64) {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, lease_id);
    }

    fn forget_lease(&self, key: &str) -> Option<i64> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, mut instance: ServiceInstance) -> Result<()> {
        if instance.namespace.is_empty() {
            instance.namespace = self.namespace.clone();
        }
        let key = self.instance_key(&instance);
        let value = serde_json::to_vec(&instance)?;

        let mut client = self.client.clone();
        let lease_id = match self.cached_lease(&key) {
            Some(lease_id) => lease_id,
            None => {
                let lease = client.lease_grant(self.ttl, None).await?;
                self.cache_lease(key.clone(), lease.id());
                lease.id()
            }
        };

        let opts = PutOptions::new().with_lease(lease_id);
        if let Err(e) = client.put(key.clone(), value, Some(opts)).await {
            // 租约可能已过期，下次注册重新申请
            self.forget_lease(&key);
            return Err(e.into());
        }

        info!(
            service = %instance.service_name,
            service_id = %instance.service_id,
            address = %instance.address,
            lease_id,
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.instance_key(instance);
        let mut client = self.client.clone();

        // 删除不存在的 key 不会报错
        client.delete(key.clone(), None).await?;

        if let Some(lease_id) = self.forget_lease(&key) {
            if let Err(e) = client.lease_revoke(lease_id).await {
                debug!(lease_id, error = %e, "Lease revoke failed, lease may have expired");
            }
        }

        info!(
            service = %instance.service_name,
            service_id = %instance.service_id,
            "Service deregistered"
        );
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.service_prefix(name), Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp.kvs().iter().filter_map(decode_instance).collect())
    }

    async fn watch(&self, name: &str) -> Result<Watcher> {
        let prefix = self.service_prefix(name);
        let opts = WatchOptions::new().with_prefix().with_prev_key();

        let mut client = self.client.clone();
        let (mut etcd_watcher, mut stream) = client.watch(prefix, Some(opts)).await?;
        let (sink, watcher) = Watcher::channel(name, self.watch_buffer);
        let service = name.to_string();

        tokio::spawn(async move {
            'stream: loop {
                let message = tokio::select! {
                    _ = sink.closed() => {
                        let _ = etcd_watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => message,
                };

                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!(service = %service, reason = %resp.cancel_reason(), "etcd watch canceled");
                            sink.fail(FlareError::registry("etcd watch canceled")).await;
                            return;
                        }
                        for event in resp.events() {
                            let Some(event) = convert_event(event) else {
                                continue;
                            };
                            if !sink.send(event).await {
                                break 'stream;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(service = %service, error = %e, "etcd watch stream error");
                        sink.fail(e.into()).await;
                        return;
                    }
                }
            }
            debug!(service = %service, "etcd watch producer stopped");
        });

        debug!(service = %name, "watch opened");
        Ok(watcher)
    }

    async fn refresh(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.instance_key(instance);
        let Some(lease_id) = self.cached_lease(&key) else {
            return self.register(instance.clone()).await;
        };

        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                debug!(service_id = %instance.service_id, lease_id, ttl = resp.ttl(), "Lease renewed");
                Ok(())
            }
            _ => {
                // 租约已过期，实例已被 etcd 摘除，重新注册
                warn!(service_id = %instance.service_id, lease_id, "Lease expired, re-registering");
                self.forget_lease(&key);
                self.register(instance.clone()).await
            }
        }
    }
}

fn decode_instance(kv: &KeyValue) -> Option<ServiceInstance> {
    match serde_json::from_slice::<ServiceInstance>(kv.value()) {
        Ok(instance) => Some(instance),
        Err(e) => {
            warn!(key = %String::from_utf8_lossy(kv.key()), error = %e, "Skipping malformed instance");
            None
        }
    }
}

/// 从键中还原实例身份，用于删除事件缺少 prev_kv 的情况
fn instance_from_key(key: &[u8]) -> Option<ServiceInstance> {
    let key = String::from_utf8_lossy(key);
    // /{namespace}/services/{service_name}/{service_id}
    let mut parts = key.trim_start_matches('/').split('/');
    let namespace = parts.next()?;
    if parts.next()? != "services" {
        return None;
    }
    let service_name = parts.next()?;
    let service_id = parts.next()?;
    Some(ServiceInstance::new(service_name, service_id, "").with_namespace(namespace))
}

fn convert_event(event: &Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    match event.event_type() {
        EventType::Put => {
            let instance = decode_instance(kv)?;
            let action = if event.prev_kv().is_some() || kv.version() > 1 {
                WatchAction::Update
            } else {
                WatchAction::Add
            };
            Some(WatchEvent::new(action, vec![instance]))
        }
        EventType::Delete => {
            let instance = event
                .prev_kv()
                .and_then(decode_instance)
                .or_else(|| instance_from_key(kv.key()))?;
            Some(WatchEvent::remove(vec![instance]))
        }
    }
}
