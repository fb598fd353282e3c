use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ChainConfig;
use crate::errors::{ChainError, ChainResult};
use crate::index::BlockNode;
use crate::types::{Block, Hash, NodeId, Peers, Timestamp};

/// The current chain tip. Replaced atomically on every extension; readers
/// always observe a consistent triple.
pub struct HeadState {
    pub node: Arc<BlockNode>,
    pub hash: Hash,
    pub height: i32,
}

impl HeadState {
    pub fn new(node: Arc<BlockNode>) -> Arc<Self> {
        Arc::new(HeadState {
            hash: node.hash(),
            height: node.height(),
            node,
        })
    }
}

/// Genesis-anchored turn clock plus the shared mutable runtime state of one
/// chain instance: peer list, head snapshot, turn counter, cancellation and
/// worker tracking.
pub struct ChainRuntime {
    genesis_time: RwLock<Timestamp>,
    genesis_hash: RwLock<Hash>,
    period: Duration,
    server: NodeId,
    peers: RwLock<Arc<Peers>>,
    head: RwLock<Option<Arc<HeadState>>>,
    next_turn: AtomicI32,
    query_ttl: i32,
    block_cache_ttl: i32,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChainRuntime {
    pub fn new(config: &ChainConfig) -> Self {
        let genesis_time = config.genesis.timestamp();
        let period = config.period;
        let now = Timestamp::now();
        let elapsed_turns = height_between(genesis_time, now, period);
        ChainRuntime {
            genesis_time: RwLock::new(genesis_time),
            genesis_hash: RwLock::new(config.genesis.block_hash()),
            period,
            server: config.server.clone(),
            peers: RwLock::new(Arc::new(config.peers.clone())),
            head: RwLock::new(None),
            // The turn counter is wall-clock anchored: a restarted node
            // resumes at the current slot, not at head + 1.
            next_turn: AtomicI32::new(elapsed_turns.max(0) + 1),
            query_ttl: config.query_ttl,
            block_cache_ttl: config.block_cache_ttl,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Pins the clock anchor to the verified genesis block.
    pub fn set_genesis(&self, block: &Block) {
        *self.genesis_time.write() = block.timestamp();
        *self.genesis_hash.write() = block.block_hash();
    }

    pub fn genesis_time(&self) -> Timestamp {
        *self.genesis_time.read()
    }

    pub fn genesis_hash(&self) -> Hash {
        *self.genesis_hash.read()
    }

    pub fn server(&self) -> &NodeId {
        &self.server
    }

    pub fn block_cache_ttl(&self) -> i32 {
        self.block_cache_ttl
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    /// Logical height of an instant: turns elapsed since genesis, negative
    /// before the chain starts.
    pub fn height_at(&self, t: Timestamp) -> i32 {
        height_between(self.genesis_time(), t, self.period)
    }

    /// Current clock reading and the delay until the next turn boundary.
    pub fn next_tick(&self) -> (Timestamp, Duration) {
        let now = self.now();
        let period = self.period.as_millis() as i64;
        let target = self.genesis_time().as_millis() + self.next_turn() as i64 * period;
        let delay = target - now.as_millis();
        (now, Duration::from_millis(delay.max(0) as u64))
    }

    pub fn next_turn(&self) -> i32 {
        self.next_turn.load(Ordering::SeqCst)
    }

    pub fn advance_next_turn(&self) {
        self.next_turn.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether this server produces the block of the current turn.
    pub fn is_my_turn(&self) -> bool {
        let peers = self.peers();
        match peers.find(&self.server) {
            Some(index) => Some(index) == producer_slot(self.next_turn(), peers.len()),
            None => false,
        }
    }

    /// Expected producer slot for a block at the given height. A block of
    /// height h is produced in turn h, so this is the producer's
    /// (next_turn - 1) mod |peers| evaluated at production time.
    pub fn producer_slot_at(&self, height: i32) -> Option<usize> {
        producer_slot(height, self.peers().len())
    }

    pub fn peers(&self) -> Arc<Peers> {
        Arc::clone(&self.peers.read())
    }

    /// Atomic whole-list swap; readers observe either the old or the new
    /// committee, never a partial one. A node absent from the new list keeps
    /// serving reads but never wins a production turn.
    pub fn update_peers(&self, peers: Peers) -> ChainResult<()> {
        if peers.is_empty() {
            return Err(ChainError::Config("peer list must not be empty".into()));
        }
        if peers.find(&self.server).is_none() {
            warn!(server = %self.server, term = peers.term, "local server left the committee");
        }
        let peers = Arc::new(peers);
        let old = std::mem::replace(&mut *self.peers.write(), Arc::clone(&peers));
        debug!(
            old_term = old.term,
            new_term = peers.term,
            servers = peers.len(),
            "updated peer list"
        );
        Ok(())
    }

    pub fn head(&self) -> Option<Arc<HeadState>> {
        self.head.read().clone()
    }

    pub fn set_head(&self, head: Arc<HeadState>) {
        *self.head.write() = Some(head);
    }

    pub fn head_height(&self) -> i32 {
        self.head().map(|head| head.height).unwrap_or(0)
    }

    /// Acks whose request height is below this are expired.
    pub fn min_valid_height(&self) -> i32 {
        self.head_height() - self.query_ttl
    }

    pub fn query_time_is_expired(&self, t: Timestamp) -> bool {
        self.height_at(t) < self.min_valid_height()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tracks a worker so `stop` can wait for it.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    /// Cancels the shared context and waits for every tracked worker.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
    }

    /// "[index/total] server" tag for log lines.
    pub fn peer_info(&self) -> String {
        let peers = self.peers();
        match peers.find(&self.server) {
            Some(index) => format!("[{}/{}] {}", index, peers.len(), self.server),
            None => format!("[-/{}] {}", peers.len(), self.server),
        }
    }

    /// Offset of the local clock from genesis, for log lines.
    pub fn chain_offset_millis(&self) -> i64 {
        self.now().millis_since(self.genesis_time())
    }
}

fn height_between(genesis: Timestamp, t: Timestamp, period: Duration) -> i32 {
    let period = period.as_millis() as i64;
    t.millis_since(genesis).div_euclid(period) as i32
}

fn producer_slot(turn: i32, total: usize) -> Option<usize> {
    if total == 0 {
        return None;
    }
    Some((turn - 1).rem_euclid(total as i32) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::crypto::generate_keypair;
    use crate::types::{DatabaseId, IsolationLevel, TokenType};
    use std::path::PathBuf;

    fn runtime_with_peers(servers: &[&str], local: &str, genesis_at: Timestamp) -> ChainRuntime {
        let keypair = generate_keypair();
        let genesis = Block::genesis(NodeId(servers[0].into()), genesis_at, &keypair).unwrap();
        let config = ChainConfig {
            database_id: DatabaseId("db".into()),
            chain_file_prefix: PathBuf::from("unused"),
            data_file: PathBuf::from("unused"),
            key_path: PathBuf::from("unused"),
            server: NodeId(local.into()),
            peers: Peers {
                term: 1,
                servers: servers.iter().map(|s| NodeId(s.to_string())).collect(),
            },
            genesis,
            period: Duration::from_secs(10),
            query_ttl: 30,
            block_cache_ttl: 30,
            update_period: 5,
            token_type: TokenType::Particle,
            gas_price: 1,
            isolation_level: IsolationLevel::Default,
            rpc_listen: None,
        };
        ChainRuntime::new(&config)
    }

    #[test]
    fn height_is_floor_of_elapsed_turns() {
        let genesis = Timestamp::from_millis(0);
        let rt = runtime_with_peers(&["p0", "p1", "p2"], "p0", genesis);
        assert_eq!(rt.height_at(Timestamp::from_millis(0)), 0);
        assert_eq!(rt.height_at(Timestamp::from_millis(9_999)), 0);
        assert_eq!(rt.height_at(Timestamp::from_millis(10_000)), 1);
        assert_eq!(rt.height_at(Timestamp::from_millis(25_000)), 2);
        // Before genesis the chain has not started.
        assert_eq!(rt.height_at(Timestamp::from_millis(-1)), -1);

        let mut last = i32::MIN;
        for millis in (0..100_000).step_by(1_000) {
            let height = rt.height_at(Timestamp::from_millis(millis));
            assert!(height >= last);
            assert_eq!(height as i64, millis / 10_000);
            last = height;
        }
    }

    #[test]
    fn rotation_follows_the_turn_counter() {
        let rt = runtime_with_peers(&["p0", "p1", "p2"], "p0", Timestamp::now());
        rt.next_turn.store(1, Ordering::SeqCst);
        assert!(rt.is_my_turn());
        rt.advance_next_turn();
        assert!(!rt.is_my_turn());
        rt.next_turn.store(4, Ordering::SeqCst);
        assert!(rt.is_my_turn());

        // A block at height h is expected from slot (h - 1) mod |peers|.
        assert_eq!(rt.producer_slot_at(1), Some(0));
        assert_eq!(rt.producer_slot_at(2), Some(1));
        assert_eq!(rt.producer_slot_at(3), Some(2));
        assert_eq!(rt.producer_slot_at(4), Some(0));
    }

    #[test]
    fn next_tick_counts_down_to_the_turn_boundary() {
        let now = Timestamp::now();
        // Genesis one period in the past: next_turn starts at 2, so the next
        // boundary is roughly one period away.
        let genesis = Timestamp::from_millis(now.as_millis() - 10_000);
        let rt = runtime_with_peers(&["p0", "p1"], "p0", genesis);
        assert_eq!(rt.next_turn(), 2);
        let (tick_now, delay) = rt.next_tick();
        assert!(tick_now.as_millis() >= now.as_millis());
        assert!(delay <= Duration::from_secs(10));
        assert!(delay > Duration::from_secs(8));
    }

    #[test]
    fn peer_swap_is_whole_list() {
        let rt = runtime_with_peers(&["p0", "p1"], "p0", Timestamp::now());
        let swapped = Peers {
            term: 2,
            servers: vec![NodeId("p0".into()), NodeId("p1".into()), NodeId("p2".into())],
        };
        rt.update_peers(swapped.clone()).unwrap();
        assert_eq!(*rt.peers(), swapped);

        // Leaving the committee is allowed; the node just never produces.
        let without_local = Peers {
            term: 3,
            servers: vec![NodeId("p1".into())],
        };
        rt.update_peers(without_local).unwrap();
        assert!(!rt.is_my_turn());

        let empty = Peers {
            term: 4,
            servers: Vec::new(),
        };
        assert!(rt.update_peers(empty).is_err());
        assert_eq!(rt.peers().term, 3);
    }
}
