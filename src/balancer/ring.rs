//! 一致性哈希环
//!
//! 每个地址在 u64 环上占 R 个虚拟节点，位置由 `blake3(replica_index ++ address)` 决定。
//! 键落在环上第一个大于等于其哈希值的虚拟节点（越过末尾则回到开头）。
//! 位置相同的虚拟节点按地址字典序排列，相同的成员集合总是得到相同的环。

use std::collections::BTreeSet;

/// 环上的物理节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNode {
    pub address: String,
    /// 该节点的虚拟节点位置（升序）
    pub tokens: Vec<u64>,
}

/// 一致性哈希环（构建后不可变）
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// (位置, 节点下标)，按位置升序，位置相同按地址字典序
    tokens: Vec<(u64, usize)>,
    /// 按地址字典序排列
    nodes: Vec<RingNode>,
    replicas: usize,
}

impl HashRing {
    /// 从地址集合构建环，重复地址只计一次
    pub fn build<I, S>(addresses: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let replicas = replicas.max(1);
        let unique: BTreeSet<String> = addresses
            .into_iter()
            .map(|address| address.as_ref().to_string())
            .collect();

        let mut tokens = Vec::with_capacity(unique.len() * replicas);
        let nodes: Vec<RingNode> = unique
            .into_iter()
            .enumerate()
            .map(|(index, address)| {
                let mut positions: Vec<u64> =
                    (0..replicas).map(|i| token_position(i, &address)).collect();
                positions.sort_unstable();
                tokens.extend(positions.iter().map(|&pos| (pos, index)));
                RingNode {
                    address,
                    tokens: positions,
                }
            })
            .collect();

        // 节点下标即地址的字典序，排序后碰撞的位置按地址决出先后
        tokens.sort_unstable();

        Self {
            tokens,
            nodes,
            replicas,
        }
    }

    /// 查找键所属的地址，空环返回 None
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.tokens.is_empty() {
            return None;
        }

        let pos = key_position(key);
        let idx = self.tokens.partition_point(|&(token, _)| token < pos);
        let (_, node) = self.tokens[idx % self.tokens.len()];
        Some(&self.nodes[node].address)
    }

    /// 所有物理节点
    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    /// 所有地址（字典序）
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.address.as_str())
    }

    /// 物理节点数
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 虚拟节点总数
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

/// 虚拟节点位置：blake3(replica_index(u32 LE) ++ address) 的前 8 字节
fn token_position(replica: usize, address: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(replica as u32).to_le_bytes());
    hasher.update(address.as_bytes());
    truncate(hasher.finalize())
}

/// 键的位置
fn key_position(key: &str) -> u64 {
    truncate(blake3::hash(key.as_bytes()))
}

fn truncate(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
