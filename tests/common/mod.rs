//! 测试共用的连接工厂

#![allow(dead_code)]

use async_trait::async_trait;
use flare_client_core::balancer::{Connection, Connector};
use flare_client_core::{FlareError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 带就绪开关的假连接
#[derive(Debug, Clone)]
pub struct FakeConn {
    pub address: String,
    ready: Arc<AtomicBool>,
}

impl FakeConn {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl Connection for FakeConn {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// 记录建连次数的假连接工厂，可以指定建连失败的地址
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub connects: Arc<AtomicUsize>,
    failing: Arc<Mutex<HashSet<String>>>,
    created: Arc<Mutex<HashMap<String, FakeConn>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn recover(&self, address: &str) {
        self.failing.lock().unwrap().remove(address);
    }

    /// 最近一次为该地址创建的连接
    pub fn conn(&self, address: &str) -> Option<FakeConn> {
        self.created.lock().unwrap().get(address).cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConn;

    async fn connect(&self, address: &str) -> Result<FakeConn> {
        if self.failing.lock().unwrap().contains(address) {
            return Err(FlareError::connection(format!("refused: {}", address)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let conn = FakeConn::new(address);
        self.created
            .lock()
            .unwrap()
            .insert(address.to_string(), conn.clone());
        Ok(conn)
    }
}

/// 生成 `count` 个成员：("10.0.0.{i}:9000", 连接)
pub fn members(count: usize) -> Vec<(String, FakeConn)> {
    (1..=count)
        .map(|i| {
            let address = format!("10.0.0.{}:9000", i);
            let conn = FakeConn::new(&address);
            (address, conn)
        })
        .collect()
}

/// 测试日志输出，重复调用是安全的
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("flare_client_core=debug")
        .with_test_writer()
        .try_init();
}

/// 只带亲和键的元数据
pub fn affinity(key: &str) -> HashMap<String, String> {
    HashMap::from([("x-shard-key".to_string(), key.to_string())])
}
