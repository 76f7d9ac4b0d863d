//! 连接池与解析任务测试

mod common;

use async_trait::async_trait;
use common::{FakeConnector, affinity, init_tracing};
use flare_client_core::balancer::{Balancer, ConnectionPool, Picker};
use flare_client_core::registry::{
    MemoryRegistry, Registry, ServiceInstance, WatchAction, WatchEvent, WatchSink, Watcher,
};
use flare_client_core::{BalancerConfig, FlareError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SERVICE: &str = "message-orchestrator";

fn instance(id: &str, address: &str) -> ServiceInstance {
    ServiceInstance::new(SERVICE, id, address)
}

/// 等待条件成立，超时则失败
async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// 测试：重复的 Add 与删除不存在的实例都不改变连接池
#[tokio::test]
async fn test_pool_apply_is_idempotent() {
    let connector = FakeConnector::new();
    let pool = ConnectionPool::new(connector.clone());
    let a = instance("a", "10.0.0.1:9000");

    assert!(pool.apply(&WatchEvent::add(vec![a.clone()])).await);
    assert!(!pool.apply(&WatchEvent::add(vec![a.clone()])).await);
    assert!(!pool.apply(&WatchEvent::update(vec![a.clone()])).await);
    assert_eq!(pool.len(), 1);
    assert_eq!(connector.connect_count(), 1);

    assert!(!pool.apply(&WatchEvent::remove(vec![instance("ghost", "10.0.0.9:9000")])).await);
    assert!(pool.apply(&WatchEvent::remove(vec![a.clone()])).await);
    assert!(!pool.apply(&WatchEvent::remove(vec![a])).await);
    assert!(pool.is_empty());
}

/// 测试：多个实例共享一个地址时按引用计数释放连接
#[tokio::test]
async fn test_pool_shared_address() {
    let connector = FakeConnector::new();
    let pool = ConnectionPool::new(connector.clone());
    let a = instance("a", "10.0.0.1:9000");
    let b = instance("b", "10.0.0.1:9000");

    pool.apply(&WatchEvent::add(vec![a.clone(), b.clone()])).await;
    assert_eq!(pool.len(), 1);
    assert_eq!(connector.connect_count(), 1);

    assert!(!pool.apply(&WatchEvent::remove(vec![a])).await);
    assert!(pool.get("10.0.0.1:9000").is_some());

    assert!(pool.apply(&WatchEvent::remove(vec![b])).await);
    assert!(pool.get("10.0.0.1:9000").is_none());
}

/// 测试：Update 事件把实例迁到新地址
#[tokio::test]
async fn test_pool_update_moves_address() {
    let pool = ConnectionPool::new(FakeConnector::new());
    pool.apply(&WatchEvent::add(vec![instance("a", "10.0.0.1:9000")]))
        .await;

    assert!(
        pool.apply(&WatchEvent::update(vec![instance("a", "10.0.0.2:9000")]))
            .await
    );
    let addresses: Vec<String> = pool.members().into_iter().map(|(a, _)| a).collect();
    assert_eq!(addresses, vec!["10.0.0.2:9000".to_string()]);
}

/// 测试：建连失败的实例被跳过
#[tokio::test]
async fn test_pool_skips_failed_connections() {
    let connector = FakeConnector::new();
    connector.fail_on("10.0.0.2:9000");
    let pool = ConnectionPool::new(connector);

    pool.apply(&WatchEvent::add(vec![
        instance("a", "10.0.0.1:9000"),
        instance("b", "10.0.0.2:9000"),
    ]))
    .await;
    assert_eq!(pool.len(), 1);
    assert!(pool.get("10.0.0.2:9000").is_none());
    assert_eq!(pool.pending().await, 1);
}

/// 测试：迁往新地址时建连失败，实例不再指向旧地址，恢复后在下一次事件时重连
#[tokio::test]
async fn test_pool_failed_move_drops_stale_address() {
    let connector = FakeConnector::new();
    let pool = ConnectionPool::new(connector.clone());
    pool.apply(&WatchEvent::add(vec![instance("a", "10.0.0.1:9000")]))
        .await;

    connector.fail_on("10.0.0.2:9000");
    let changed = pool
        .apply(&WatchEvent::update(vec![instance("a", "10.0.0.2:9000")]))
        .await;
    assert!(changed);
    assert!(pool.is_empty());
    assert_eq!(pool.pending().await, 1);

    connector.recover("10.0.0.2:9000");
    assert!(
        pool.apply(&WatchEvent::add(vec![instance("b", "10.0.0.3:9000")]))
            .await
    );
    let mut addresses: Vec<String> = pool.members().into_iter().map(|(a, _)| a).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["10.0.0.2:9000", "10.0.0.3:9000"]);
    assert_eq!(pool.pending().await, 0);
}

/// 测试：等待重试的实例被删除或不在全量快照中时不再重试
#[tokio::test]
async fn test_pool_pending_is_dropped_on_remove_and_resync() {
    let connector = FakeConnector::new();
    connector.fail_on("10.0.0.1:9000");
    connector.fail_on("10.0.0.2:9000");
    let pool = ConnectionPool::new(connector.clone());

    pool.apply(&WatchEvent::add(vec![
        instance("a", "10.0.0.1:9000"),
        instance("b", "10.0.0.2:9000"),
    ]))
    .await;
    assert_eq!(pool.pending().await, 2);

    pool.apply(&WatchEvent::remove(vec![instance("a", "10.0.0.1:9000")]))
        .await;
    assert_eq!(pool.pending().await, 1);

    connector.recover("10.0.0.1:9000");
    pool.resync(&[]).await;
    assert_eq!(pool.pending().await, 0);
    assert!(pool.is_empty());
    assert_eq!(connector.connect_count(), 0);
}

/// 测试：全量同步替换成员
#[tokio::test]
async fn test_pool_resync() {
    let pool = ConnectionPool::new(FakeConnector::new());
    pool.apply(&WatchEvent::add(vec![
        instance("a", "10.0.0.1:9000"),
        instance("b", "10.0.0.2:9000"),
    ]))
    .await;

    let changed = pool
        .resync(&[instance("b", "10.0.0.2:9000"), instance("c", "10.0.0.3:9000")])
        .await;
    assert!(changed);

    let mut addresses: Vec<String> = pool.members().into_iter().map(|(a, _)| a).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["10.0.0.2:9000", "10.0.0.3:9000"]);

    assert!(
        !pool
            .resync(&[instance("b", "10.0.0.2:9000"), instance("c", "10.0.0.3:9000")])
            .await
    );
}

/// 测试：解析任务把注册中心的变化同步到选择器
#[tokio::test]
async fn test_balancer_follows_registry() {
    init_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(instance("a", "10.0.0.1:9000")).await.unwrap();
    registry.register(instance("b", "10.0.0.2:9000")).await.unwrap();

    let balancer = Balancer::start(
        registry.clone(),
        SERVICE,
        FakeConnector::new(),
        &BalancerConfig::default(),
    )
    .await
    .unwrap();

    // 启动时已完成首次同步
    assert_eq!(balancer.picker().snapshot().len(), 2);
    let owner = balancer.pick(&affinity("user-1")).unwrap();

    registry.register(instance("c", "10.0.0.3:9000")).await.unwrap();
    eventually("third backend", || balancer.picker().snapshot().len() == 3).await;

    registry.deregister(&instance("a", "10.0.0.1:9000")).await.unwrap();
    registry.deregister(&instance("b", "10.0.0.2:9000")).await.unwrap();
    eventually("two removals", || balancer.picker().snapshot().len() == 1).await;
    assert_eq!(
        balancer.pick(&affinity("user-1")).unwrap().address,
        "10.0.0.3:9000"
    );
    assert_ne!(owner.address, "10.0.0.3:9000");

    registry.deregister(&instance("c", "10.0.0.3:9000")).await.unwrap();
    eventually("empty picker", || balancer.picker().snapshot().is_empty()).await;
    assert!(matches!(
        balancer.pick(&HashMap::new()),
        Err(FlareError::Unavailable(_))
    ));

    assert!(!balancer.resolver().is_finished());
    balancer.shutdown().await.unwrap();
}

/// 测试：短时间内的大量变化最终收敛
#[tokio::test]
async fn test_resolver_converges_after_burst() {
    init_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let connector = FakeConnector::new();
    let pool = Arc::new(ConnectionPool::new(connector));
    let picker = Arc::new(Picker::new(SERVICE, &BalancerConfig::default()));

    let resolver = flare_client_core::Resolver::spawn(
        registry.clone(),
        SERVICE,
        pool.clone(),
        picker.clone(),
    )
    .await
    .unwrap();

    // 不让出执行权，监听可能落后并要求全量同步
    for i in 0..1_200 {
        registry
            .register(instance(&format!("n-{}", i), &format!("10.1.{}.{}:9000", i / 250, i % 250)))
            .await
            .unwrap();
    }

    eventually("all backends", || picker.snapshot().len() == 1_200).await;
    assert_eq!(pool.len(), 1_200);
    resolver.shutdown().await.unwrap();
}

/// 测试：选中的连接失效后，不需要成员变化也会被跳过
#[tokio::test]
async fn test_unready_connection_is_skipped_without_membership_change() {
    init_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let connector = FakeConnector::new();
    registry.register(instance("a", "10.0.0.1:9000")).await.unwrap();
    registry.register(instance("b", "10.0.0.2:9000")).await.unwrap();

    let config = BalancerConfig {
        readiness_interval_ms: 0,
        ..BalancerConfig::default()
    };
    let balancer = Balancer::start(registry.clone(), SERVICE, connector.clone(), &config)
        .await
        .unwrap();

    let owner = balancer.pick(&affinity("user-9")).unwrap();
    connector.conn(&owner.address).unwrap().set_ready(false);
    assert!(matches!(
        balancer.picker().pick(&affinity("user-9")),
        Err(FlareError::NotFound(_))
    ));

    let next = balancer.pick(&affinity("user-9")).unwrap();
    assert_ne!(next.address, owner.address);
    assert_eq!(balancer.picker().snapshot().len(), 1);

    balancer.shutdown().await.unwrap();
}

/// 测试：解析任务定期检查就绪状态，连接失效与恢复都会反映到选择器
#[tokio::test]
async fn test_resolver_refreshes_readiness_in_background() {
    init_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let connector = FakeConnector::new();
    registry.register(instance("a", "10.0.0.1:9000")).await.unwrap();
    registry.register(instance("b", "10.0.0.2:9000")).await.unwrap();

    let config = BalancerConfig {
        readiness_interval_ms: 10,
        ..BalancerConfig::default()
    };
    let balancer = Balancer::start(registry.clone(), SERVICE, connector.clone(), &config)
        .await
        .unwrap();
    assert_eq!(balancer.picker().snapshot().len(), 2);

    let conn = connector.conn("10.0.0.1:9000").unwrap();
    conn.set_ready(false);
    eventually("unready backend dropped", || {
        balancer.picker().snapshot().addresses() == ["10.0.0.2:9000".to_string()]
    })
    .await;

    conn.set_ready(true);
    eventually("backend restored", || balancer.picker().snapshot().len() == 2).await;

    balancer.shutdown().await.unwrap();
}

/// 测试：解析任务可以正常停止
#[tokio::test]
async fn test_resolver_shutdown_is_clean() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
    let pool = Arc::new(ConnectionPool::new(FakeConnector::new()));
    let picker = Arc::new(Picker::new(SERVICE, &BalancerConfig::default()));

    let resolver = flare_client_core::Resolver::spawn(registry, SERVICE, pool, picker)
        .await
        .unwrap();
    assert_eq!(resolver.service(), SERVICE);
    assert!(!resolver.is_finished());
    assert!(resolver.shutdown().await.is_ok());
}

/// 首次查询成功、之后查询失败的注册中心，监听事件由测试手动推送
#[derive(Default)]
struct FlakyRegistry {
    queries: AtomicUsize,
    sink: Mutex<Option<WatchSink>>,
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn register(&self, _instance: ServiceInstance) -> flare_client_core::Result<()> {
        Ok(())
    }

    async fn deregister(&self, _instance: &ServiceInstance) -> flare_client_core::Result<()> {
        Ok(())
    }

    async fn get_service(&self, _name: &str) -> flare_client_core::Result<Vec<ServiceInstance>> {
        if self.queries.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(vec![instance("a", "10.0.0.1:9000")])
        } else {
            Err(FlareError::registry("backend down"))
        }
    }

    async fn watch(&self, name: &str) -> flare_client_core::Result<Watcher> {
        let (sink, watcher) = Watcher::channel(name, 8);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(watcher)
    }
}

/// 测试：监听报告错误后全量同步失败，解析任务带着该错误退出
#[tokio::test]
async fn test_resolver_exits_when_resync_fails() {
    init_tracing();
    let registry = Arc::new(FlakyRegistry::default());
    let pool = Arc::new(ConnectionPool::new(FakeConnector::new()));
    let picker = Arc::new(Picker::new(SERVICE, &BalancerConfig::default()));

    let resolver = flare_client_core::Resolver::spawn(
        registry.clone(),
        SERVICE,
        pool.clone(),
        picker.clone(),
    )
    .await
    .unwrap();
    assert_eq!(picker.snapshot().len(), 1);

    let sink = registry.sink.lock().unwrap().take().unwrap();
    assert!(
        sink.send(WatchEvent::error(
            WatchAction::Update,
            FlareError::registry("watch lagged")
        ))
        .await
    );

    let result = tokio::time::timeout(Duration::from_secs(5), resolver.join())
        .await
        .expect("resolver did not exit");
    assert_eq!(result, Err(FlareError::Registry("backend down".to_string())));
    assert!(sink.is_closed());
    // 退出前的成员保持不变
    assert_eq!(picker.snapshot().len(), 1);
}
