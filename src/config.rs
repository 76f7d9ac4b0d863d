//! 客户端配置
//!
//! 所有组件的配置都以普通结构体的形式显式传入构造函数，库内不持有全局状态。

use crate::error::{ErrorKind, InfraResult, InfraResultExt, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> InfraResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path))?;
        Ok(config)
    }

    /// 读取配置文件，错误统一转换为 `FlareError::Config`
    pub fn load(path: &str) -> Result<Self> {
        Self::load_from_file(path).into_flare(ErrorKind::Config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .context("failed to parse config")
            .into_flare(ErrorKind::Config)
    }
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_type")]
    pub registry_type: String, // etcd, consul, memory
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 实例存活时间（秒），超过该时间未续期的实例由注册中心摘除
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// 续期间隔（秒）
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// 每个监听的事件队列容量
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.max(1))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: default_registry_type(),
            endpoints: Vec::new(),
            namespace: default_namespace(),
            ttl: default_ttl(),
            refresh_interval: default_refresh_interval(),
            watch_buffer: default_watch_buffer(),
        }
    }
}

fn default_registry_type() -> String {
    "etcd".to_string()
}

fn default_namespace() -> String {
    "flare".to_string()
}

fn default_ttl() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_watch_buffer() -> usize {
    64
}

/// 负载均衡配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// 承载亲和键的 metadata 字段
    #[serde(default = "default_affinity_key")]
    pub affinity_key: String,
    /// 每个物理节点在哈希环上的虚拟节点数
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// pick 遇到失效连接时刷新快照并重选的次数
    #[serde(default = "default_pick_attempts")]
    pub pick_attempts: usize,
    /// 后台检查连接就绪状态的间隔（毫秒），0 表示只在 pick 失败时检查
    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,
}

impl BalancerConfig {
    pub fn readiness_interval(&self) -> Option<Duration> {
        (self.readiness_interval_ms > 0).then(|| Duration::from_millis(self.readiness_interval_ms))
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            affinity_key: default_affinity_key(),
            replicas: default_replicas(),
            pick_attempts: default_pick_attempts(),
            readiness_interval_ms: default_readiness_interval_ms(),
        }
    }
}

fn default_affinity_key() -> String {
    "x-shard-key".to_string()
}

fn default_replicas() -> usize {
    50
}

fn default_pick_attempts() -> usize {
    3
}

fn default_readiness_interval_ms() -> u64 {
    1000
}

/// 重试配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<i32>,
    #[serde(default)]
    pub retryable_error_kinds: Vec<ErrorKind>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retryable_status_codes: default_retryable_status_codes(),
            retryable_error_kinds: Vec::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_retryable_status_codes() -> Vec<i32> {
    // 14 = UNAVAILABLE
    vec![tonic::Code::Unavailable as i32]
}

/// 退避配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// 立即重试
    #[default]
    None,
    /// 固定延迟
    Fixed { delay_ms: u64 },
    /// 指数退避
    Exponential { base_delay_ms: u64, max_delay_ms: u64 },
}

/// 连接配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 单次请求超时，0 表示不设置
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    30_000
}
