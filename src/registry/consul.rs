//! Consul 服务注册发现实现
//!
//! 实例注册为 Consul agent 服务，服务名即 `service_name`，命名空间作为 tag。
//! 每个实例带一个 TTL 健康检查，续期即把检查置为 passing。
//! 监听基于 blocking query（`X-Consul-Index`），相邻两次结果的差异转换为增量事件。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::instance::{ServiceInstance, WatchEvent};
use super::trait_def::Registry;
use super::watcher::{WatchSink, Watcher};
use crate::config::RegistryConfig;
use crate::error::{FlareError, Result};

/// blocking query 的最长等待时间
const WATCH_WAIT: &str = "55s";

/// Consul 要求的最小自动摘除时间
const MIN_DEREGISTER_AFTER: u64 = 60;

/// Consul 服务注册发现
#[derive(Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    ttl: u64,
    watch_buffer: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    tags: Vec<String>,
    address: String,
    port: u16,
    meta: HashMap<String, String>,
    check: AgentServiceCheck,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL")]
    ttl: String,
    status: String,
    deregister_critical_service_after: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

impl ConsulRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let endpoint = config
            .endpoints
            .first()
            .ok_or_else(|| FlareError::config("consul endpoints not configured"))?;
        let base_url = if endpoint.contains("://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };

        info!(base_url = %base_url, namespace = %config.namespace, "Using consul registry");

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            namespace: config.namespace.clone(),
            ttl: config.ttl.max(1),
            watch_buffer: config.watch_buffer,
        })
    }

    fn check_id(service_id: &str) -> String {
        format!("service:{}", service_id)
    }

    fn registration(&self, instance: &ServiceInstance) -> Result<AgentServiceRegistration> {
        let (host, port) = split_address(&instance.address)?;
        let namespace = if instance.namespace.is_empty() {
            self.namespace.clone()
        } else {
            instance.namespace.clone()
        };

        Ok(AgentServiceRegistration {
            id: instance.service_id.clone(),
            name: instance.service_name.clone(),
            tags: vec![namespace],
            address: host.to_string(),
            port,
            meta: instance.metadata.clone(),
            check: AgentServiceCheck {
                check_id: Self::check_id(&instance.service_id),
                ttl: format!("{}s", self.ttl),
                status: "passing".to_string(),
                deregister_critical_service_after: format!(
                    "{}s",
                    (self.ttl * 2).max(MIN_DEREGISTER_AFTER)
                ),
            },
        })
    }

    /// 查询健康实例；`index` 不为空时发起 blocking query，返回结果与新的索引
    async fn query(&self, name: &str, index: Option<u64>) -> Result<(Vec<ServiceInstance>, u64)> {
        let url = format!("{}/v1/health/service/{}", self.base_url, name);
        let mut request = self
            .client
            .get(&url)
            .query(&[("passing", "true"), ("tag", self.namespace.as_str())]);
        if let Some(index) = index {
            request = request.query(&[("index", index.to_string().as_str()), ("wait", WATCH_WAIT)]);
        }

        let response = request.send().await?.error_for_status()?;
        let last_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let entries: Vec<HealthEntry> = response.json().await?;

        let instances = entries
            .into_iter()
            .map(|entry| {
                let host = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                let mut instance = ServiceInstance::new(
                    entry.service.service,
                    entry.service.id,
                    format!("{}:{}", host, entry.service.port),
                )
                .with_namespace(self.namespace.clone());
                instance.metadata = entry.service.meta.unwrap_or_default();
                instance
            })
            .collect();

        Ok((instances, last_index))
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let registration = self.registration(&instance)?;
        let url = format!("{}/v1/agent/service/register", self.base_url);
        self.client
            .put(&url)
            .json(&registration)
            .send()
            .await?
            .error_for_status()?;

        info!(
            service = %instance.service_name,
            service_id = %instance.service_id,
            address = %instance.address,
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, instance.service_id
        );
        self.client.put(&url).send().await?.error_for_status()?;

        info!(
            service = %instance.service_name,
            service_id = %instance.service_id,
            "Service deregistered"
        );
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let (instances, _) = self.query(name, None).await?;
        Ok(instances)
    }

    async fn watch(&self, name: &str) -> Result<Watcher> {
        let (sink, watcher) = Watcher::channel(name, self.watch_buffer);
        tokio::spawn(run_watch(self.clone(), name.to_string(), sink));

        debug!(service = %name, "watch opened");
        Ok(watcher)
    }

    async fn refresh(&self, instance: &ServiceInstance) -> Result<()> {
        let url = format!(
            "{}/v1/agent/check/pass/{}",
            self.base_url,
            Self::check_id(&instance.service_id)
        );
        let response = self.client.put(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // 检查已被 agent 摘除，重新注册
            warn!(service_id = %instance.service_id, "TTL check missing, re-registering");
            return self.register(instance.clone()).await;
        }
        response.error_for_status()?;

        debug!(service_id = %instance.service_id, "TTL check passed");
        Ok(())
    }
}

async fn run_watch(registry: ConsulRegistry, service: String, sink: WatchSink) {
    let mut known: HashMap<String, ServiceInstance> = HashMap::new();
    let mut index = 0u64;

    loop {
        let result = tokio::select! {
            _ = sink.closed() => break,
            result = registry.query(&service, Some(index)) => result,
        };

        let (instances, last_index) = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(service = %service, error = %e, "consul watch query failed");
                sink.fail(e).await;
                return;
            }
        };

        // 索引回退时从头开始
        index = if last_index < index { 0 } else { last_index };

        for event in diff_instances(&known, &instances) {
            if !sink.send(event).await {
                debug!(service = %service, "consul watch producer stopped");
                return;
            }
        }
        known = instances
            .into_iter()
            .map(|instance| (instance.service_id.clone(), instance))
            .collect();

        if index == 0 {
            // 没有拿到索引时避免空转
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    debug!(service = %service, "consul watch producer stopped");
}

/// 比较前后两次查询结果，生成 Add / Update / Remove 增量事件（空事件不生成）
pub fn diff_instances(
    previous: &HashMap<String, ServiceInstance>,
    current: &[ServiceInstance],
) -> Vec<WatchEvent> {
    let mut added = Vec::new();
    let mut updated = Vec::new();
    for instance in current {
        match previous.get(&instance.service_id) {
            None => added.push(instance.clone()),
            Some(old) if old != instance => updated.push(instance.clone()),
            Some(_) => {}
        }
    }

    let mut removed: Vec<ServiceInstance> = previous
        .values()
        .filter(|old| !current.iter().any(|i| i.service_id == old.service_id))
        .cloned()
        .collect();
    removed.sort_by(|a, b| a.service_id.cmp(&b.service_id));

    let mut events = Vec::new();
    if !added.is_empty() {
        events.push(WatchEvent::add(added));
    }
    if !updated.is_empty() {
        events.push(WatchEvent::update(updated));
    }
    if !removed.is_empty() {
        events.push(WatchEvent::remove(removed));
    }
    events
}

fn split_address(address: &str) -> Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| FlareError::config(format!("Invalid address {}", address)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| FlareError::config(format!("Invalid port in {}: {}", address, e)))?;
    Ok((host, port))
}
