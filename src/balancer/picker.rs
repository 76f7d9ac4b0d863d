//! 一致性哈希选择器
//!
//! 成员变化时整体重建 [`PickerState`] 并原子替换，并发的 `pick()` 只会看到某一个完整的快照。
//! 连接的就绪状态可能在两次成员变化之间改变，[`Picker::refresh`] 按快照中的成员重新筛选就绪连接。

use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::connector::Connection;
use super::ring::HashRing;
use crate::config::BalancerConfig;
use crate::error::{FlareError, Result};
use crate::metadata::MetadataCarrier;

/// 选择器快照（不可变）
#[derive(Debug, Clone)]
pub struct PickerState<C> {
    ring: HashRing,
    conns: HashMap<String, C>,
    /// 随机回退使用的地址列表（字典序）
    addresses: Vec<String>,
    /// 全部成员（含未就绪的），重复地址保留第一个
    members: Vec<(String, C)>,
}

impl<C: Connection> PickerState<C> {
    /// 从 (地址, 连接) 构建快照，只保留就绪的连接，重复地址保留第一个
    pub fn build<I>(members: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = (String, C)>,
    {
        let mut seen = HashSet::new();
        let mut all: Vec<(String, C)> = Vec::new();
        let mut conns = HashMap::new();
        for (address, conn) in members {
            if !seen.insert(address.clone()) {
                continue;
            }
            if conn.is_ready() {
                conns.insert(address.clone(), conn.clone());
            }
            all.push((address, conn));
        }

        let ring = HashRing::build(conns.keys(), replicas);
        let addresses = ring.addresses().map(str::to_string).collect();

        Self {
            ring,
            conns,
            addresses,
            members: all,
        }
    }

    pub fn empty(replicas: usize) -> Self {
        Self::build(std::iter::empty(), replicas)
    }

    /// 按亲和键选出地址；没有键时在就绪地址中均匀随机
    pub fn select(&self, key: Option<&str>) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        match key {
            Some(key) => self.ring.get(key),
            None => {
                let index = rand::thread_rng().gen_range(0..self.addresses.len());
                Some(self.addresses[index].as_str())
            }
        }
    }

    /// 地址对应的存活连接
    pub fn connection(&self, address: &str) -> Option<&C> {
        self.conns.get(address).filter(|conn| conn.is_ready())
    }

    /// 成员的就绪状态是否与快照构建时不同
    pub fn readiness_changed(&self) -> bool {
        self.members
            .iter()
            .any(|(address, conn)| conn.is_ready() != self.conns.contains_key(address))
    }

    /// 全部成员（含未就绪的）
    pub fn members(&self) -> &[(String, C)] {
        &self.members
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// 负载均衡选择器
pub struct Picker<C> {
    service: String,
    affinity_key: String,
    replicas: usize,
    readiness_interval: Option<Duration>,
    state: ArcSwap<PickerState<C>>,
}

impl<C: Connection> Picker<C> {
    pub fn new(service: impl Into<String>, config: &BalancerConfig) -> Self {
        Self {
            service: service.into(),
            affinity_key: config.affinity_key.clone(),
            replicas: config.replicas,
            readiness_interval: config.readiness_interval(),
            state: ArcSwap::from_pointee(PickerState::empty(config.replicas)),
        }
    }

    /// 为一次调用选择连接
    ///
    /// - 没有就绪后端：`Unavailable`
    /// - 选中的地址在快照中没有存活连接：`NotFound`，调用方 `refresh()` 后重新 pick
    pub fn pick<M>(&self, metadata: &M) -> Result<C>
    where
        M: MetadataCarrier + ?Sized,
    {
        let state = self.state.load();
        let key = metadata
            .get(&self.affinity_key)
            .filter(|key| !key.is_empty());

        let Some(address) = state.select(key) else {
            return Err(FlareError::unavailable(&self.service));
        };
        if key.is_none() {
            debug!(service = %self.service, address, "No affinity key, picked at random");
        }

        state
            .connection(address)
            .cloned()
            .ok_or_else(|| FlareError::NotFound(address.to_string()))
    }

    /// 选中的连接失效时先按就绪状态刷新快照再重新 pick，最多 `attempts` 次
    ///
    /// 所有成员都未就绪时同样会刷新一次，有连接恢复就能选中
    pub fn pick_with_retry<M>(&self, metadata: &M, attempts: usize) -> Result<C>
    where
        M: MetadataCarrier + ?Sized,
    {
        let mut result = self.pick(metadata);
        for _ in 1..attempts.max(1) {
            match &result {
                Err(FlareError::NotFound(_)) => {
                    self.refresh();
                }
                Err(FlareError::Unavailable(_)) => {
                    if !self.refresh() {
                        break;
                    }
                }
                _ => break,
            }
            result = self.pick(metadata);
        }
        result
    }

    /// 成员不变，按连接当前的就绪状态重建快照
    ///
    /// 就绪集合没有变化时不做任何事；返回是否替换了快照。
    /// 与 `rebuild` 并发时以 `rebuild` 为准，本次刷新放弃。
    pub fn refresh(&self) -> bool {
        let current = self.state.load_full();
        if !current.readiness_changed() {
            return false;
        }

        let state = Arc::new(PickerState::build(
            current.members().iter().cloned(),
            self.replicas,
        ));
        let backends = state.len();
        let previous = self.state.compare_and_swap(&current, state);
        if !Arc::ptr_eq(&*previous, &current) {
            return false;
        }
        debug!(
            service = %self.service,
            backends,
            members = current.members().len(),
            "Picker refreshed after readiness change"
        );
        true
    }

    /// 用新的成员集合重建快照并原子替换
    pub fn rebuild<I>(&self, members: I)
    where
        I: IntoIterator<Item = (String, C)>,
    {
        let state = PickerState::build(members, self.replicas);
        info!(
            service = %self.service,
            backends = state.len(),
            tokens = state.ring().token_count(),
            "Picker rebuilt"
        );
        self.state.store(Arc::new(state));
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<PickerState<C>> {
        self.state.load_full()
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn affinity_key(&self) -> &str {
        &self.affinity_key
    }

    /// 后台检查就绪状态的间隔，`None` 表示不检查
    pub fn readiness_interval(&self) -> Option<Duration> {
        self.readiness_interval
    }
}
