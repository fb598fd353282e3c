use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::store::{tagged_key, BLOCK_TAG};
use crate::types::{Block, Hash};

/// In-memory mirror of a persisted block.
///
/// Nodes are owned by the [`BlockIndex`] for the process lifetime and hold a
/// weak back-reference to their parent; the chain is a tree rooted at
/// genesis, so the links never cycle. The cached body may be dropped at any
/// time without invalidating the node.
pub struct BlockNode {
    hash: Hash,
    height: i32,
    count: i32,
    parent: Weak<BlockNode>,
    block: RwLock<Option<Arc<Block>>>,
}

impl BlockNode {
    pub fn new(height: i32, block: Arc<Block>, parent: Option<&Arc<BlockNode>>) -> Arc<BlockNode> {
        Arc::new(BlockNode {
            hash: block.block_hash(),
            height,
            count: parent.map(|parent| parent.count + 1).unwrap_or(0),
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            block: RwLock::new(Some(block)),
        })
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn parent(&self) -> Option<Arc<BlockNode>> {
        self.parent.upgrade()
    }

    /// Store key of the backing block record.
    pub fn block_key(&self) -> Vec<u8> {
        tagged_key(BLOCK_TAG, self.height, &self.hash)
    }

    pub fn cached_block(&self) -> Option<Arc<Block>> {
        self.block.read().clone()
    }

    pub fn cache_block(&self, block: Arc<Block>) {
        *self.block.write() = Some(block);
    }

    /// Drops the cached body. Returns false if there was none.
    pub fn evict_body(&self) -> bool {
        self.block.write().take().is_some()
    }

    pub fn has_body(&self) -> bool {
        self.block.read().is_some()
    }

    /// Latest ancestor at or before the given height. Heights may skip over
    /// missed turns, so an exact match is not guaranteed.
    pub fn ancestor(self: &Arc<Self>, height: i32) -> Option<Arc<BlockNode>> {
        let mut node = Arc::clone(self);
        while node.height > height {
            node = node.parent.upgrade()?;
        }
        Some(node)
    }

    /// Ancestor at exactly the given count.
    pub fn ancestor_by_count(self: &Arc<Self>, count: i32) -> Option<Arc<BlockNode>> {
        let mut node = Arc::clone(self);
        while node.count > count {
            node = node.parent.upgrade()?;
        }
        (node.count == count).then_some(node)
    }
}

/// Hash-keyed index over every block node this chain has accepted.
/// Append-only while the chain runs; only body caches are pruned.
#[derive(Default)]
pub struct BlockIndex {
    nodes: RwLock<HashMap<Hash, Arc<BlockNode>>>,
}

impl BlockIndex {
    pub fn new() -> Self {
        BlockIndex::default()
    }

    pub fn add_block(&self, node: Arc<BlockNode>) {
        self.nodes.write().insert(node.hash(), node);
    }

    pub fn lookup_node(&self, hash: &Hash) -> Option<Arc<BlockNode>> {
        self.nodes.read().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn hashes(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self.nodes.read().keys().copied().collect();
        hashes.sort();
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::types::{Block, NodeId, Timestamp};

    fn node_chain(heights: &[i32]) -> (BlockIndex, Vec<Arc<BlockNode>>) {
        let keypair = generate_keypair();
        let index = BlockIndex::new();
        let mut nodes: Vec<Arc<BlockNode>> = Vec::new();
        for (i, height) in heights.iter().enumerate() {
            let block = Arc::new(
                Block::genesis(
                    NodeId(format!("node-{i}")),
                    Timestamp::from_millis(*height as i64 * 10_000),
                    &keypair,
                )
                .unwrap(),
            );
            let node = BlockNode::new(*height, block, nodes.last());
            index.add_block(Arc::clone(&node));
            nodes.push(node);
        }
        (index, nodes)
    }

    #[test]
    fn parent_links_and_counts_line_up() {
        let (index, nodes) = node_chain(&[0, 1, 2, 5, 6]);
        assert_eq!(index.len(), 5);
        for pair in nodes.windows(2) {
            let parent = pair[1].parent().expect("parent");
            assert_eq!(parent.hash(), pair[0].hash());
            assert_eq!(pair[1].count(), parent.count() + 1);
        }
        let looked_up = index.lookup_node(&nodes[3].hash()).expect("node");
        assert_eq!(looked_up.height(), 5);
    }

    #[test]
    fn ancestor_lands_on_latest_at_or_before_height() {
        let (_, nodes) = node_chain(&[0, 1, 2, 5, 6]);
        let head = nodes.last().unwrap();
        // Height 4 was skipped; the latest ancestor at or before it is height 2.
        assert_eq!(head.ancestor(4).unwrap().height(), 2);
        assert_eq!(head.ancestor(5).unwrap().height(), 5);
        assert_eq!(head.ancestor(6).unwrap().height(), 6);
        assert!(head.ancestor(-1).is_none());
    }

    #[test]
    fn ancestor_by_count_is_exact() {
        let (_, nodes) = node_chain(&[0, 1, 2, 5, 6]);
        let head = nodes.last().unwrap();
        assert_eq!(head.ancestor_by_count(3).unwrap().height(), 5);
        assert_eq!(head.ancestor_by_count(0).unwrap().height(), 0);
        assert!(head.ancestor_by_count(9).is_none());
    }

    #[test]
    fn body_eviction_keeps_the_node() {
        let (index, nodes) = node_chain(&[0, 1]);
        let node = &nodes[1];
        assert!(node.has_body());
        let body = node.cached_block().unwrap();
        assert!(node.evict_body());
        assert!(!node.evict_body());
        assert!(index.lookup_node(&node.hash()).is_some());

        // A store reload re-populates the cache without touching the node.
        node.cache_block(body);
        assert!(node.has_body());
        assert!(node.evict_body());
    }
}
