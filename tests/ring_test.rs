//! 一致性哈希环测试

use flare_client_core::HashRing;
use std::collections::HashMap;

fn addresses(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("10.0.0.{}:9000", i)).collect()
}

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("user-{}", i)).collect()
}

/// 测试：空环
#[test]
fn test_empty_ring() {
    let ring = HashRing::build(Vec::<String>::new(), 50);
    assert!(ring.is_empty());
    assert_eq!(ring.token_count(), 0);
    assert_eq!(ring.get("anything"), None);
}

/// 测试：相同成员（顺序不同、含重复）得到相同的环
#[test]
fn test_ring_is_deterministic() {
    let forward = addresses(5);
    let mut shuffled = forward.clone();
    shuffled.reverse();
    shuffled.push(forward[2].clone());

    let a = HashRing::build(&forward, 50);
    let b = HashRing::build(&shuffled, 50);

    assert_eq!(a.len(), 5);
    assert_eq!(b.len(), 5);
    assert_eq!(a.token_count(), 5 * 50);
    assert_eq!(b.token_count(), 5 * 50);
    assert_eq!(a.nodes(), b.nodes());
    for key in keys(2_000) {
        assert_eq!(a.get(&key), b.get(&key), "key {} mapped differently", key);
    }
}

/// 测试：地址按字典序排列，每个节点有 R 个虚拟节点
#[test]
fn test_ring_nodes() {
    let ring = HashRing::build(["b:1", "a:1", "c:1"], 8);
    let addresses: Vec<&str> = ring.addresses().collect();
    assert_eq!(addresses, vec!["a:1", "b:1", "c:1"]);
    assert_eq!(ring.replicas(), 8);
    for node in ring.nodes() {
        assert_eq!(node.tokens.len(), 8);
        assert!(node.tokens.windows(2).all(|w| w[0] <= w[1]));
    }
}

/// 测试：replicas 为 0 时按 1 处理
#[test]
fn test_zero_replicas() {
    let ring = HashRing::build(["a:1"], 0);
    assert_eq!(ring.replicas(), 1);
    assert_eq!(ring.get("key"), Some("a:1"));
}

/// 测试：单节点环总是返回该节点
#[test]
fn test_single_node() {
    let ring = HashRing::build(["only:1"], 50);
    for key in keys(100) {
        assert_eq!(ring.get(&key), Some("only:1"));
    }
}

/// 测试：键在节点之间大致均匀分布
#[test]
fn test_ring_balance() {
    let ring = HashRing::build(addresses(5), 50);
    let total = 20_000;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for key in keys(total) {
        let owner = ring.get(&key).unwrap();
        *counts.entry(owner).or_default() += 1;
    }

    assert_eq!(counts.len(), 5);
    for (address, count) in counts {
        let share = count as f64 / total as f64;
        assert!(
            (0.08..0.35).contains(&share),
            "{} owns {:.3} of the keys",
            address,
            share
        );
    }
}

/// 测试：加入节点时只有约 1/N 的键迁移，且全部迁到新节点
#[test]
fn test_add_node_moves_keys_to_new_node_only() {
    let before = HashRing::build(addresses(5), 50);
    let after = HashRing::build(addresses(6), 50);
    let new_node = "10.0.0.6:9000";

    let total = 10_000;
    let mut moved = 0;
    for key in keys(total) {
        let old = before.get(&key).unwrap();
        let new = after.get(&key).unwrap();
        if old != new {
            assert_eq!(new, new_node, "key {} moved between old nodes", key);
            moved += 1;
        }
    }

    let fraction = moved as f64 / total as f64;
    assert!(
        fraction > 0.05 && fraction < 0.35,
        "moved fraction {:.3}",
        fraction
    );
}

/// 测试：移除节点时只有该节点的键迁移
#[test]
fn test_remove_node_only_moves_its_keys() {
    let all = addresses(5);
    let removed = all[3].clone();
    let remaining: Vec<String> = all.iter().filter(|a| **a != removed).cloned().collect();

    let before = HashRing::build(&all, 50);
    let after = HashRing::build(&remaining, 50);

    for key in keys(5_000) {
        let old = before.get(&key).unwrap();
        let new = after.get(&key).unwrap();
        if old != removed {
            assert_eq!(old, new, "key {} moved although its owner stayed", key);
        } else {
            assert_ne!(new, removed);
        }
    }
}
