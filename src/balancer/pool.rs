//! 连接池
//!
//! 根据监听事件维护 地址 → 连接 的映射。读多写少：读取方拿到的是整体替换的快照，
//! 写入只发生在解析任务这一条路径上。

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connector::Connector;
use crate::registry::{ServiceInstance, WatchAction, WatchEvent};

/// 连接池
pub struct ConnectionPool<K: Connector> {
    connector: K,
    members: Mutex<Members<K::Connection>>,
    snapshot: ArcSwap<HashMap<String, K::Connection>>,
}

struct Members<C> {
    /// service_id -> address
    ids: HashMap<String, String>,
    /// address -> 引用该地址的实例数
    refs: HashMap<String, usize>,
    conns: HashMap<String, C>,
    /// 建连失败、等待重试的实例
    pending: HashMap<String, ServiceInstance>,
}

impl<C> Default for Members<C> {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
            refs: HashMap::new(),
            conns: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl<C> Members<C> {
    /// 释放地址引用，最后一个引用释放时关闭连接
    fn release(&mut self, address: &str) -> bool {
        let Some(count) = self.refs.get_mut(address) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.refs.remove(address);
        self.conns.remove(address);
        debug!(address, "Connection released");
        true
    }

    /// 摘除实例，返回连接集合是否变化
    fn forget(&mut self, id: &str) -> bool {
        self.pending.remove(id);
        match self.ids.remove(id) {
            Some(address) => self.release(&address),
            None => false,
        }
    }
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            members: Mutex::new(Members::default()),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// 应用一个监听事件，返回连接集合是否变化
    ///
    /// 事件应用是幂等的：重复的 Add、删除不存在的实例都不会改变状态。
    /// 建连失败的实例暂时摘除并进入待重试集合，下一次 `apply` 或 `resync` 时重试。
    pub async fn apply(&self, event: &WatchEvent) -> bool {
        let mut members = self.members.lock().await;
        let mut changed = self.retry_pending(&mut members).await;

        match event.action {
            WatchAction::Add | WatchAction::Update => {
                for instance in &event.instances {
                    members.pending.remove(&instance.service_id);
                    changed |= self.upsert(&mut members, instance).await;
                }
            }
            WatchAction::Remove => {
                for instance in &event.instances {
                    changed |= members.forget(&instance.service_id);
                }
            }
        }

        if changed {
            self.publish(&members);
        }
        changed
    }

    /// 用全量快照替换成员，返回连接集合是否变化
    pub async fn resync(&self, instances: &[ServiceInstance]) -> bool {
        let mut members = self.members.lock().await;
        let mut changed = false;

        let stale: Vec<String> = members
            .ids
            .keys()
            .chain(members.pending.keys())
            .filter(|id| !instances.iter().any(|i| &i.service_id == *id))
            .cloned()
            .collect();
        for id in stale {
            changed |= members.forget(&id);
        }

        for instance in instances {
            members.pending.remove(&instance.service_id);
            changed |= self.upsert(&mut members, instance).await;
        }

        if changed {
            self.publish(&members);
        }
        info!(instances = instances.len(), connections = members.conns.len(), "Connection pool resynced");
        changed
    }

    async fn upsert(&self, members: &mut Members<K::Connection>, instance: &ServiceInstance) -> bool {
        let id = &instance.service_id;
        let address = &instance.address;

        match members.ids.get(id) {
            Some(current) if current == address => return false,
            _ => {}
        }

        let mut changed = false;
        if !members.conns.contains_key(address) {
            match self.connector.connect(address).await {
                Ok(conn) => {
                    members.conns.insert(address.clone(), conn);
                    changed = true;
                    debug!(address = %address, "Connection created");
                }
                Err(e) => {
                    warn!(service_id = %id, address = %address, error = %e, "Failed to connect, instance pending");
                    // 不能继续指向旧地址，先摘除，等待重试
                    let changed = members.forget(id);
                    members.pending.insert(id.clone(), instance.clone());
                    return changed;
                }
            }
        }

        // 实例更换地址时释放旧地址
        if let Some(previous) = members.ids.insert(id.clone(), address.clone()) {
            changed |= members.release(&previous);
        }
        *members.refs.entry(address.clone()).or_insert(0) += 1;
        changed
    }

    /// 重试建连失败的实例
    async fn retry_pending(&self, members: &mut Members<K::Connection>) -> bool {
        if members.pending.is_empty() {
            return false;
        }
        let pending: Vec<ServiceInstance> = members.pending.drain().map(|(_, i)| i).collect();
        let mut changed = false;
        for instance in &pending {
            changed |= self.upsert(members, instance).await;
        }
        changed
    }

    /// 等待重试的实例数
    pub async fn pending(&self) -> usize {
        self.members.lock().await.pending.len()
    }

    fn publish(&self, members: &Members<K::Connection>) {
        self.snapshot.store(Arc::new(members.conns.clone()));
    }

    /// 当前所有 (地址, 连接)
    pub fn members(&self) -> Vec<(String, K::Connection)> {
        self.snapshot
            .load()
            .iter()
            .map(|(address, conn)| (address.clone(), conn.clone()))
            .collect()
    }

    /// 按地址获取连接
    pub fn get(&self, address: &str) -> Option<K::Connection> {
        self.snapshot.load().get(address).cloned()
    }

    /// 连接数
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
