use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::ack::AckIndex;
use crate::api;
use crate::config::ChainConfig;
use crate::crypto::{load_or_generate_keypair, pub_key_hash};
use crate::errors::{ChainError, ChainResult};
use crate::index::{BlockIndex, BlockNode};
use crate::rpc::{
    AddTxReq, AdviseNewBlockReq, FetchBlockReq, MainChainClient, NextAccountNonceReq, PeerCaller,
};
use crate::runtime::{ChainRuntime, HeadState};
use crate::state::SqlState;
use crate::store::{key_height, tagged_key, KvStore, ACK_TAG, BLOCK_TAG, RESPONSE_TAG};
use crate::types::{
    Address, Block, Header, QueryAsTx, Request, Response, SignedAckHeader, SignedResponseHeader,
    Timestamp, BLOCK_VERSION,
};

/// Bound on retained past-turn blocks kept for offline fork analysis.
const SIDE_BLOCK_LIMIT: usize = 64;

/// One chain instance serving a single logical database.
///
/// Head mutations are totally ordered: the ingest loop is the sole writer,
/// and the producer path feeds it through the pending-block channel.
pub struct Chain {
    config: ChainConfig,
    block_store: KvStore,
    query_store: KvStore,
    block_index: BlockIndex,
    ack_index: AckIndex,
    state: Arc<dyn SqlState>,
    caller: Arc<dyn PeerCaller>,
    main_chain: Arc<dyn MainChainClient>,
    pub(crate) rt: ChainRuntime,
    blocks_tx: mpsc::Sender<Block>,
    blocks_rx: Mutex<Option<mpsc::Receiver<Block>>>,
    heights_tx: mpsc::Sender<i32>,
    heights_rx: Mutex<Option<mpsc::Receiver<i32>>>,
    keypair: Keypair,
    address: Address,
    cached_block_count: AtomicI32,
    side_blocks: Mutex<Vec<Block>>,
}

impl Chain {
    /// Opens both stores, loads the signing key, rebuilds the in-memory index
    /// from persisted blocks, and bootstraps genesis when the store is empty.
    pub fn new(
        config: ChainConfig,
        state: Arc<dyn SqlState>,
        caller: Arc<dyn PeerCaller>,
        main_chain: Arc<dyn MainChainClient>,
    ) -> ChainResult<Self> {
        let config = config.validated()?;
        debug!(db = %config.database_id, "opening chain stores");
        let block_store = KvStore::open(&config.block_store_path())?;
        let query_store = KvStore::open(&config.query_store_path())?;

        let keypair = load_or_generate_keypair(&config.key_path)?;
        let address = pub_key_hash(&keypair.public);

        let rt = ChainRuntime::new(&config);
        let (blocks_tx, blocks_rx) = mpsc::channel(1);
        let (heights_tx, heights_rx) = mpsc::channel(1);

        let chain = Chain {
            block_store,
            query_store,
            block_index: BlockIndex::new(),
            ack_index: AckIndex::new(),
            state,
            caller,
            main_chain,
            rt,
            blocks_tx,
            blocks_rx: Mutex::new(Some(blocks_rx)),
            heights_tx,
            heights_rx: Mutex::new(Some(heights_rx)),
            keypair,
            address,
            cached_block_count: AtomicI32::new(0),
            side_blocks: Mutex::new(Vec::new()),
            config,
        };
        chain.replay()?;
        Ok(chain)
    }

    /// Rebuilds the block index by walking persisted blocks in height order.
    fn replay(&self) -> ChainResult<()> {
        let entries = self.block_store.scan_tag(BLOCK_TAG)?;
        let mut last: Option<Arc<BlockNode>> = None;
        let mut next_seq = 0u64;
        for (key, value) in entries {
            let block: Block = rmp_serde::from_slice(&value)?;
            debug!(
                db = %self.config.database_id,
                block = %block.block_hash(),
                height = key_height(&key),
                "loading block from store"
            );
            let parent = match &last {
                None => {
                    block.verify_as_genesis()?;
                    self.rt.set_genesis(&block);
                    None
                }
                Some(last_node) if block.parent_hash() == last_node.hash() => {
                    block.verify()?;
                    Some(Arc::clone(last_node))
                }
                Some(_) => Some(
                    self.block_index
                        .lookup_node(&block.parent_hash())
                        .ok_or(ChainError::ParentNotFound)?,
                ),
            };
            if let Some(seq) = block.calc_next_seq() {
                next_seq = next_seq.max(seq);
            }
            let height = self.rt.height_at(block.timestamp());
            let node = BlockNode::new(height, Arc::new(block), parent.as_ref());
            self.cached_block_count.fetch_add(1, Ordering::Relaxed);
            self.block_index.add_block(Arc::clone(&node));
            last = Some(node);
        }

        let Some(last) = last else {
            return self.genesis();
        };
        self.rt.set_head(HeadState::new(last));
        self.state.set_seq(next_seq);
        self.prune_block_cache();

        // In-flight responses and acks are lost across restarts by design;
        // decode what was persisted for diagnostics only.
        for (key, value) in self.query_store.scan_tag(RESPONSE_TAG)? {
            let response: SignedResponseHeader = rmp_serde::from_slice(&value)?;
            debug!(
                db = %self.config.database_id,
                height = key_height(&key),
                header = %response.hash,
                "loaded response header"
            );
        }
        for (key, value) in self.query_store.scan_tag(ACK_TAG)? {
            let ack: SignedAckHeader = rmp_serde::from_slice(&value)?;
            debug!(
                db = %self.config.database_id,
                height = key_height(&key),
                header = %ack.hash,
                "loaded ack header"
            );
        }
        Ok(())
    }

    fn genesis(&self) -> ChainResult<()> {
        self.config.genesis.verify_as_genesis()?;
        self.rt.set_genesis(&self.config.genesis);
        self.push_block(self.config.genesis.clone())
    }

    /// Spawns the ingest worker, performs initial catch-up, spawns the tick
    /// loop, and registers the RPC service when a listen address is set.
    pub async fn start(self: &Arc<Self>) -> ChainResult<()> {
        let blocks_rx = self
            .blocks_rx
            .lock()
            .take()
            .ok_or_else(|| ChainError::State("chain already started".into()))?;
        let heights_rx = self
            .heights_rx
            .lock()
            .take()
            .ok_or_else(|| ChainError::State("chain already started".into()))?;

        let ingest = Arc::clone(self);
        self.rt
            .track(tokio::spawn(ingest.process_blocks(blocks_rx, heights_rx)));

        self.sync().await;

        let cycle = Arc::clone(self);
        self.rt.track(tokio::spawn(cycle.main_cycle()));

        if let Some(addr) = self.config.rpc_listen {
            let service = Arc::clone(self);
            self.rt.track(tokio::spawn(async move {
                if let Err(err) = api::serve(service, addr).await {
                    if !err.is_cancelled() {
                        error!(%err, "chain RPC service failed");
                    }
                }
            }));
        }
        Ok(())
    }

    /// Cancels the shared context, waits for workers, then closes the block
    /// store, the query store, and the SQL state in that order. The first
    /// close error is returned; later ones are logged.
    pub async fn stop(&self) -> ChainResult<()> {
        debug!(db = %self.config.database_id, "stopping chain");
        self.rt.stop().await;
        debug!(db = %self.config.database_id, "chain service and workers stopped");

        let mut result = Ok(());
        for (name, outcome) in [
            ("block store", self.block_store.close()),
            ("query store", self.query_store.close()),
            ("sql state", self.state.close(false)),
        ] {
            if let Err(err) = outcome {
                error!(%err, "failed to close {name}");
                if result.is_ok() && !err.is_cancelled() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Initial catch-up. Each pass fetches the block of the missing turn and
    /// advances the turn counter exactly once, so the loop terminates even
    /// when every peer is unreachable.
    async fn sync(&self) {
        debug!(db = %self.config.database_id, "synchronizing chain state");
        loop {
            let now = self.rt.now();
            if now < self.rt.genesis_time() {
                debug!("clock is before genesis time, waiting for chain start");
                return;
            }
            if self.rt.next_turn() > self.rt.height_at(now) {
                return;
            }
            self.sync_head().await;
            self.rt.advance_next_turn();
        }
    }

    /// Main tick loop: synchronize the head, then either sleep to the next
    /// boundary or run the current turn.
    async fn main_cycle(self: Arc<Self>) {
        let cancel = self.rt.cancellation();
        loop {
            if cancel.is_cancelled() {
                debug!(db = %self.config.database_id, "abort main cycle");
                return;
            }
            self.sync_head().await;
            let (now, delay) = self.rt.next_tick();
            if delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            } else {
                self.run_current_turn(now).await;
            }
        }
    }

    /// Runs one turn: produce if it is our slot, then always emit stats,
    /// prune the body cache, advance the turn, expire acks, and notify the
    /// ingest loop of the new height.
    async fn run_current_turn(&self, now: Timestamp) {
        debug!(
            db = %self.config.database_id,
            peer = %self.rt.peer_info(),
            next_turn = self.rt.next_turn(),
            head_height = self.rt.head_height(),
            using_timestamp = %now,
            "run current turn"
        );
        if self.rt.head_height() < self.rt.next_turn() - 1 {
            error!(
                head_height = self.rt.head_height(),
                next_turn = self.rt.next_turn(),
                "a block will be skipped"
            );
        }
        if self.rt.is_my_turn() {
            if let Err(err) = self.produce_block(now).await {
                if !err.is_cancelled() {
                    error!(%err, "failed to produce block");
                }
            }
        }

        self.stat();
        self.prune_block_cache();
        self.rt.advance_next_turn();
        self.ack_index.advance(self.rt.min_valid_height());
        let height = self.rt.head_height();
        let cancel = self.rt.cancellation();
        tokio::select! {
            _ = self.heights_tx.send(height) => {}
            _ = cancel.cancelled() => {}
        }
    }

    /// Prepares, signs, enqueues, and advises the block of the current turn.
    async fn produce_block(&self, now: Timestamp) -> ChainResult<()> {
        let (failed_reqs, trackers) = self
            .state
            .commit()
            .map_err(|err| ChainError::State(format!("failed to fetch query list: {err}")))?;
        if failed_reqs.is_empty() && trackers.is_empty() {
            debug!(
                db = %self.config.database_id,
                "no query found in current period, skip block producing"
            );
            return Ok(());
        }

        let cancel = self.rt.cancellation();
        let mut query_txs: Vec<QueryAsTx> = Vec::with_capacity(trackers.len());
        for tracker in &trackers {
            tracker.wait_ready(&cancel).await?;
            query_txs.push(tracker.query_tx()?);
        }

        let header = Header {
            version: BLOCK_VERSION,
            producer: self.rt.server().clone(),
            genesis_hash: self.rt.genesis_hash(),
            parent_hash: self.rt.head().map(|head| head.hash).unwrap_or_default(),
            merkle_root: Default::default(),
            timestamp: now,
        };
        let acks = self.ack_index.acks(self.rt.height_at(now));
        let block = Block::pack_and_sign(header, failed_reqs, query_txs, acks, &self.keypair)?;
        let block_hash = block.block_hash();

        self.send_pending_block(block.clone()).await?;
        debug!(
            db = %self.config.database_id,
            block_hash = %block_hash,
            using_timestamp = %now,
            "produced new block"
        );

        // Advise the new block to the other peers, in parallel, no retry.
        let count = match self.block_index.lookup_node(&block_hash) {
            Some(node) => node.count(),
            None => self
                .block_index
                .lookup_node(&block.parent_hash())
                .map(|parent| parent.count() + 1)
                .unwrap_or(-1),
        };
        let req = AdviseNewBlockReq {
            database_id: self.config.database_id.clone(),
            block,
            count,
        };
        let peers = self.rt.peers();
        let mut fanout = JoinSet::new();
        for server in &peers.servers {
            if server == self.rt.server() {
                continue;
            }
            let caller = Arc::clone(&self.caller);
            let server = server.clone();
            let req = req.clone();
            fanout.spawn(async move {
                if let Err(err) = caller.advise_new_block(&server, req).await {
                    error!(remote = %server, %err, "failed to advise new block");
                }
            });
        }
        while fanout.join_next().await.is_some() {}
        Ok(())
    }

    /// Fetches the block of the current turn from peers when it has not been
    /// advised yet. The first peer returning a block wins; the fetched block
    /// is delivered to the ingest channel.
    async fn sync_head(&self) {
        let turn_height = self.rt.next_turn() - 1;
        if self.rt.head_height() >= turn_height {
            return;
        }
        let req = FetchBlockReq {
            database_id: self.config.database_id.clone(),
            height: turn_height,
        };
        let peers = self.rt.peers();
        let total = peers.len();
        for (i, server) in peers.servers.iter().enumerate() {
            if server == self.rt.server() {
                continue;
            }
            match self.caller.fetch_block(server, req.clone()).await {
                Ok(resp) => {
                    if let Some(block) = resp.block {
                        if self.send_pending_block(block).await.is_err() {
                            info!("abort head block synchronizing");
                            return;
                        }
                        debug!(
                            remote = %format!("[{i}/{total}] {server}"),
                            height = turn_height,
                            "fetched block from remote peer"
                        );
                        return;
                    }
                    debug!(remote = %format!("[{i}/{total}] {server}"), "peer has no block");
                }
                Err(err) => {
                    debug!(
                        remote = %format!("[{i}/{total}] {server}"),
                        %err,
                        "failed to fetch block from peer"
                    );
                }
            }
        }
        debug!(
            db = %self.config.database_id,
            height = turn_height,
            "cannot get block from any peer"
        );
    }

    /// Serial ingest loop over pending blocks and height-advance
    /// notifications. The sole writer of head state.
    async fn process_blocks(
        self: Arc<Self>,
        mut blocks_rx: mpsc::Receiver<Block>,
        mut heights_rx: mpsc::Receiver<i32>,
    ) {
        let cancel = self.rt.cancellation();
        let stash_cancel = cancel.child_token();
        let mut stash: Vec<Block> = Vec::new();
        let mut returners = JoinSet::new();
        loop {
            while returners.try_join_next().is_some() {}
            tokio::select! {
                height = heights_rx.recv() => {
                    let Some(height) = height else { break };
                    debug!(
                        db = %self.config.database_id,
                        height,
                        stashed = stash.len(),
                        "read new height from channel"
                    );
                    if !stash.is_empty() {
                        // Re-enqueue stashed blocks in arrival order for
                        // re-evaluation against the new turn.
                        let drained = std::mem::take(&mut stash);
                        let tx = self.blocks_tx.clone();
                        let cancel = stash_cancel.clone();
                        returners.spawn(async move {
                            for (i, block) in drained.iter().enumerate() {
                                tokio::select! {
                                    sent = tx.send(block.clone()) => {
                                        if sent.is_err() {
                                            return;
                                        }
                                    }
                                    _ = cancel.cancelled() => {
                                        debug!(remaining = drained.len() - i, "abort stash returning");
                                        return;
                                    }
                                }
                            }
                        });
                    }
                }
                block = blocks_rx.recv() => {
                    let Some(block) = block else { break };
                    self.process_block(block, &mut stash).await;
                }
                _ = cancel.cancelled() => {
                    debug!(db = %self.config.database_id, "abort block processing");
                    break;
                }
            }
        }
        stash_cancel.cancel();
        while returners.join_next().await.is_some() {}
    }

    async fn process_block(&self, block: Block, stash: &mut Vec<Block>) {
        let height = self.rt.height_at(block.timestamp());
        let turn_height = self.rt.next_turn() - 1;
        debug!(
            db = %self.config.database_id,
            block_height = height,
            block_hash = %block.block_hash(),
            "processing new block"
        );
        if height > turn_height {
            // Future block, keep for the next turn.
            stash.push(block);
            return;
        }
        if height < turn_height {
            self.note_side_block(block, height);
            return;
        }
        if let Err(err) = self.check_and_push_new_block(block).await {
            error!(%err, "failed to check and push new block");
            return;
        }
        let Some(head) = self.rt.head() else { return };
        if head.node.count() as u64 % self.config.update_period == 0 {
            if let Err(err) = self.run_billing(&head.node).await {
                warn!(%err, "billing round aborted");
            }
        }
    }

    /// Hook for blocks at a past turn. No fork resolution is attempted: the
    /// block is kept in a bounded side list for offline analysis.
    fn note_side_block(&self, block: Block, height: i32) {
        warn!(
            db = %self.config.database_id,
            block_hash = %block.block_hash(),
            block_height = height,
            next_turn = self.rt.next_turn(),
            "dropping block at past turn"
        );
        let mut side = self.side_blocks.lock();
        if side.len() < SIDE_BLOCK_LIMIT {
            side.push(block);
        }
    }

    /// Validates a peer's block against the current head and rotation slot,
    /// replays it on the SQL state, and extends the chain.
    pub async fn check_and_push_new_block(&self, block: Block) -> ChainResult<()> {
        let height = self.rt.height_at(block.timestamp());
        let head = self.rt.head().ok_or(ChainError::InvalidBlock)?;
        debug!(
            db = %self.config.database_id,
            block = %block.block_hash(),
            producer = %block.producer(),
            block_height = height,
            block_parent = %block.parent_hash(),
            head_height = head.height,
            "checking new block from other peer"
        );

        if head.height == height && head.hash == block.block_hash() {
            // Already applied, typically set by a head fetch.
            return Ok(());
        }
        if block.parent_hash() != head.hash {
            error!(
                block_parent = %block.parent_hash(),
                head = %head.hash,
                "invalid new block for the current chain"
            );
            return Err(ChainError::InvalidBlock);
        }

        block.verify()?;

        // Short-circuit for self-produced blocks re-entering via ingest.
        if block.producer() == self.rt.server() {
            return self.push_block(block);
        }

        let peers = self.rt.peers();
        let index = peers.find(block.producer()).ok_or_else(|| {
            error!(producer = %block.producer(), "unknown producer of new block");
            ChainError::UnknownProducer
        })?;
        let expected = self.rt.producer_slot_at(height);
        if Some(index) != expected {
            error!(?expected, actual = index, "invalid producer of new block");
            return Err(ChainError::InvalidProducer);
        }

        self.state.replay_block(&block).await.map_err(|err| {
            error!(%err, "failed to replay new block");
            err
        })?;
        self.push_block(block)
    }

    /// Extends the chain with a validated block. The store write happens
    /// before the in-memory head swap; a crash in between leaves an orphan
    /// suffix in the block store that startup replay re-accepts.
    fn push_block(&self, block: Block) -> ChainResult<()> {
        let block = Arc::new(block);
        let height = self.rt.height_at(block.timestamp());
        let parent = self.rt.head();
        let node = BlockNode::new(height, Arc::clone(&block), parent.as_ref().map(|h| &h.node));
        let head = HeadState::new(Arc::clone(&node));

        let encoded = rmp_serde::to_vec(block.as_ref())?;
        self.block_store.put(&node.block_key(), &encoded)?;

        self.rt.set_head(head);
        self.block_index.add_block(node);
        self.cached_block_count.fetch_add(1, Ordering::Relaxed);

        for (i, tx) in block.query_txs.iter().enumerate() {
            if let Err(err) = self.add_response(tx.response.clone()) {
                warn!(index = i, %err, "failed to add response to ack index");
            }
        }
        for (i, ack) in block.acks.iter().enumerate() {
            if let Err(err) = self.remove_ack(ack) {
                warn!(index = i, %err, "failed to remove ack from ack index");
            }
        }

        info!(
            db = %self.config.database_id,
            block = %block.block_hash().short(),
            producer = %block.producer(),
            query_count = block.query_txs.len(),
            ack_count = block.acks.len(),
            height,
            head_height = self.rt.head_height(),
            "pushed new block"
        );
        Ok(())
    }

    /// Forwards a query to the SQL state.
    pub async fn query(
        &self,
        request: Request,
        is_leader: bool,
    ) -> ChainResult<(crate::state::QueryTracker, Response)> {
        self.state.query(request, is_leader).await
    }

    /// Records a response awaiting acknowledgement and persists it.
    pub fn add_response(&self, response: SignedResponseHeader) -> ChainResult<()> {
        let height = self.rt.height_at(response.request_timestamp());
        let key = tagged_key(RESPONSE_TAG, height, &response.hash);
        let encoded = rmp_serde::to_vec(&response)?;
        self.query_store.put(&key, &encoded)?;
        self.ack_index.add_response(height, response)
    }

    /// Verifies an acknowledged query and registers it for block inclusion.
    pub fn verify_and_push_acked_query(&self, ack: SignedAckHeader) -> ChainResult<()> {
        if self.rt.query_time_is_expired(ack.request_timestamp()) {
            debug!(
                min_valid = self.rt.min_valid_height(),
                ack_height = self.rt.height_at(ack.request_timestamp()),
                "rejecting expired ack"
            );
            return Err(ChainError::QueryExpired);
        }
        ack.verify()?;
        self.push_acked_query(ack)
    }

    fn push_acked_query(&self, ack: SignedAckHeader) -> ChainResult<()> {
        debug!(db = %self.config.database_id, ack = %ack.hash, "pushing acked query");
        let bucket = self.rt.height_at(ack.request_timestamp());
        self.ack_index.register(bucket, ack.clone())?;

        let key = tagged_key(
            ACK_TAG,
            self.rt.height_at(ack.response_timestamp()),
            &ack.hash,
        );
        let encoded = rmp_serde::to_vec(&ack)?;
        self.query_store.put(&key, &encoded)?;
        Ok(())
    }

    fn remove_ack(&self, ack: &SignedAckHeader) -> ChainResult<()> {
        self.ack_index
            .remove(self.rt.height_at(ack.request_timestamp()), ack)
    }

    /// Routes an advised block to the pending channel after sanity checks;
    /// validation runs on the ingest loop.
    pub async fn advise_new_block(&self, req: AdviseNewBlockReq) -> ChainResult<()> {
        if req.database_id != self.config.database_id {
            return Err(ChainError::Config(format!(
                "advised block targets database {}",
                req.database_id
            )));
        }
        self.send_pending_block(req.block).await
    }

    /// Replaces the committee in one atomic swap.
    pub fn update_peers(&self, peers: crate::types::Peers) -> ChainResult<()> {
        self.rt.update_peers(peers)
    }

    /// Block at the latest ancestor height <= the given height.
    pub fn fetch_block(&self, height: i32) -> ChainResult<Option<Block>> {
        Ok(self
            .fetch_block_with_node(height)?
            .map(|(block, _)| block))
    }

    pub(crate) fn fetch_block_with_node(
        &self,
        height: i32,
    ) -> ChainResult<Option<(Block, Arc<BlockNode>)>> {
        let Some(head) = self.rt.head() else {
            return Ok(None);
        };
        let Some(node) = head.node.ancestor(height) else {
            return Ok(None);
        };
        let block = self.load_block_body(&node)?;
        Ok(Some((block, node)))
    }

    /// Block at exactly the given count; negative counts resolve to head.
    pub fn fetch_block_by_count(&self, count: i32) -> ChainResult<Option<(Block, i32, i32)>> {
        let Some(head) = self.rt.head() else {
            return Ok(None);
        };
        let node = if count < 0 {
            Some(Arc::clone(&head.node))
        } else {
            head.node.ancestor_by_count(count)
        };
        let Some(node) = node else {
            return Ok(None);
        };
        let block = self.load_block_body(&node)?;
        Ok(Some((block, node.count(), node.height())))
    }

    pub(crate) fn load_block_body(&self, node: &Arc<BlockNode>) -> ChainResult<Block> {
        if let Some(block) = node.cached_block() {
            return Ok(block.as_ref().clone());
        }
        let value = self
            .block_store
            .get(&node.block_key())?
            .ok_or_else(|| ChainError::State(format!("missing block record {}", node.hash())))?;
        let block: Block = rmp_serde::from_slice(&value)?;
        // Re-populate the evicted body so repeated reads within the window
        // (billing walks, peer fetches) hit the cache.
        node.cache_block(Arc::new(block.clone()));
        self.cached_block_count.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Runs one billing round for the window ending at the given node and
    /// submits the signed update to the main chain. Best-effort: any error
    /// aborts this round only.
    async fn run_billing(&self, node: &Arc<BlockNode>) -> ChainResult<()> {
        let mut header = self.build_billing(node)?;
        let nonce = self
            .main_chain
            .next_account_nonce(NextAccountNonceReq { addr: self.address })
            .await?;
        header.nonce = nonce.nonce;
        let update = header.sign(&self.keypair)?;
        debug!(
            db = %self.config.database_id,
            nonce = nonce.nonce,
            addr = %self.address,
            "submitting billing update"
        );
        self.main_chain
            .add_tx(AddTxReq { tx: update, ttl: 1 })
            .await?;
        Ok(())
    }

    async fn send_pending_block(&self, block: Block) -> ChainResult<()> {
        let cancel = self.rt.cancellation();
        tokio::select! {
            sent = self.blocks_tx.send(block) => {
                sent.map_err(|_| ChainError::Cancelled)
            }
            _ = cancel.cancelled() => Err(ChainError::Cancelled),
        }
    }

    /// Drops cached block bodies older than the cache TTL, walking from head
    /// until an already-evicted node is reached.
    fn prune_block_cache(&self) {
        let Some(head) = self.rt.head() else { return };
        let cutoff = head.node.count() - self.rt.block_cache_ttl();
        let mut node = Some(Arc::clone(&head.node));
        while let Some(current) = node.clone() {
            if current.count() <= cutoff {
                break;
            }
            node = current.parent();
        }
        while let Some(current) = node {
            if !current.evict_body() {
                break;
            }
            self.cached_block_count.fetch_sub(1, Ordering::Relaxed);
            node = current.parent();
        }
    }

    fn stat(&self) {
        info!(
            db = %self.config.database_id,
            peer = %self.rt.peer_info(),
            offset_ms = self.rt.chain_offset_millis(),
            response_header_count = self.ack_index.response_count(),
            registered_ack_count = self.ack_index.ack_count(),
            cached_block_count = self.cached_block_count.load(Ordering::Relaxed),
            "chain mem stats"
        );
    }

    pub fn database_id(&self) -> &crate::types::DatabaseId {
        &self.config.database_id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Snapshot of the current tip as (hash, height, count).
    pub fn head_state(&self) -> Option<(crate::types::Hash, i32, i32)> {
        self.rt
            .head()
            .map(|head| (head.hash, head.height, head.node.count()))
    }

    pub fn cached_block_count(&self) -> i32 {
        self.cached_block_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn block_index(&self) -> &BlockIndex {
        &self.block_index
    }

    pub(crate) fn config(&self) -> &ChainConfig {
        &self.config
    }
}
