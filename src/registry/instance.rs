//! 服务实例与监听事件定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::FlareError;

/// 服务实例
///
/// 以 `service_id` 作为身份标识。同一个 ID 的再次注册会整体替换旧实例。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// 命名空间
    pub namespace: String,

    /// 服务名（如 "signaling-online", "message-orchestrator"）
    pub service_name: String,

    /// 实例 ID（唯一标识）
    pub service_id: String,

    /// 服务地址（host:port）
    pub address: String,

    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new(
        service_name: impl Into<String>,
        service_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            namespace: String::new(),
            service_name: service_name.into(),
            service_id: service_id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// 设置命名空间
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 转换为 gRPC URI
    pub fn to_grpc_uri(&self) -> String {
        format!("http://{}", self.address)
    }
}

/// 监听动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchAction {
    Add,
    Update,
    Remove,
}

/// 监听事件
///
/// 事件是增量的：`instances` 只包含受影响的实例，而不是全量快照。
/// 消费方必须幂等地应用事件，重复的 Add 不会产生副作用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub instances: Vec<ServiceInstance>,
    pub action: WatchAction,
    /// 后端报告的错误。携带错误的事件意味着之前可能丢失了事件，消费方应全量重新同步
    pub error: Option<FlareError>,
}

impl WatchEvent {
    pub fn new(action: WatchAction, instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances,
            action,
            error: None,
        }
    }

    pub fn add(instances: Vec<ServiceInstance>) -> Self {
        Self::new(WatchAction::Add, instances)
    }

    pub fn update(instances: Vec<ServiceInstance>) -> Self {
        Self::new(WatchAction::Update, instances)
    }

    pub fn remove(instances: Vec<ServiceInstance>) -> Self {
        Self::new(WatchAction::Remove, instances)
    }

    /// 只携带错误的事件
    pub fn error(action: WatchAction, error: FlareError) -> Self {
        Self {
            instances: Vec::new(),
            action,
            error: Some(error),
        }
    }
}
