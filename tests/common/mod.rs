#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use parking_lot::Mutex;

use sqlchain::config::ChainConfig;
use sqlchain::crypto::{generate_keypair, pub_key_hash};
use sqlchain::errors::ChainResult;
use sqlchain::rpc::{
    AddTxReq, AddTxResp, AdviseNewBlockReq, AdviseNewBlockResp, FetchBlockReq, FetchBlockResp,
    MainChainClient, NextAccountNonceReq, NextAccountNonceResp, PeerCaller,
};
use sqlchain::state::{QueryTracker, SqlState};
use sqlchain::types::{
    Block, DatabaseId, Hash, Header, IsolationLevel, NodeId, Peers, Query, QueryAsTx, QueryType,
    Request, RequestHeader, Response, ResponseHeader, SignedRequestHeader, SignedResponseHeader,
    Timestamp, TokenType, UpdateBilling, BLOCK_VERSION,
};

/// In-memory SQL backend double: completes queries immediately and records
/// replayed blocks and the restored sequence.
pub struct MemoryState {
    keypair: Keypair,
    node_id: NodeId,
    pending: Mutex<Vec<QueryTracker>>,
    replayed: Mutex<Vec<Hash>>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl MemoryState {
    pub fn new(node_id: NodeId) -> Self {
        MemoryState {
            keypair: generate_keypair(),
            node_id,
            pending: Mutex::new(Vec::new()),
            replayed: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn replayed(&self) -> Vec<Hash> {
        self.replayed.lock().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlState for MemoryState {
    async fn query(
        &self,
        request: Request,
        _is_leader: bool,
    ) -> ChainResult<(QueryTracker, Response)> {
        let header = ResponseHeader {
            request: request.header.header.clone(),
            request_hash: request.hash(),
            node_id: self.node_id.clone(),
            timestamp: Timestamp::now(),
            row_count: 1,
            affected_rows: u64::from(request.header.header.query_type == QueryType::Write),
            response_account: pub_key_hash(&self.keypair.public),
        };
        let signed = SignedResponseHeader::sign(header, &self.keypair)?;
        let tracker = QueryTracker::new(request);
        tracker.complete(signed.clone());
        self.pending.lock().push(tracker.clone());
        let response = Response {
            header: Some(signed),
            columns: vec!["result".into()],
            rows: vec![vec!["1".into()]],
        };
        Ok((tracker, response))
    }

    fn commit(&self) -> ChainResult<(Vec<Request>, Vec<QueryTracker>)> {
        Ok((Vec::new(), std::mem::take(&mut *self.pending.lock())))
    }

    async fn replay_block(&self, block: &Block) -> ChainResult<()> {
        self.replayed.lock().push(block.block_hash());
        Ok(())
    }

    fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::SeqCst);
    }

    fn close(&self, _drop_data: bool) -> ChainResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Peer transport double recording advises; fetches always come back empty.
#[derive(Default)]
pub struct RecordingCaller {
    advised: Mutex<Vec<(NodeId, AdviseNewBlockReq)>>,
}

impl RecordingCaller {
    pub fn advised(&self) -> Vec<(NodeId, AdviseNewBlockReq)> {
        self.advised.lock().clone()
    }
}

#[async_trait]
impl PeerCaller for RecordingCaller {
    async fn advise_new_block(
        &self,
        node: &NodeId,
        req: AdviseNewBlockReq,
    ) -> ChainResult<AdviseNewBlockResp> {
        self.advised.lock().push((node.clone(), req));
        Ok(AdviseNewBlockResp::default())
    }

    async fn fetch_block(
        &self,
        _node: &NodeId,
        _req: FetchBlockReq,
    ) -> ChainResult<FetchBlockResp> {
        Ok(FetchBlockResp::default())
    }
}

/// Main-chain double serving nonces and recording submitted billing updates.
#[derive(Default)]
pub struct RecordingMainChain {
    nonce: AtomicU64,
    txs: Mutex<Vec<UpdateBilling>>,
}

impl RecordingMainChain {
    pub fn submitted(&self) -> Vec<UpdateBilling> {
        self.txs.lock().clone()
    }
}

#[async_trait]
impl MainChainClient for RecordingMainChain {
    async fn next_account_nonce(
        &self,
        _req: NextAccountNonceReq,
    ) -> ChainResult<NextAccountNonceResp> {
        Ok(NextAccountNonceResp {
            nonce: self.nonce.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn add_tx(&self, req: AddTxReq) -> ChainResult<AddTxResp> {
        self.txs.lock().push(req.tx);
        Ok(AddTxResp::default())
    }
}

pub struct Committee {
    pub servers: Vec<NodeId>,
    pub keypairs: Vec<Keypair>,
}

impl Committee {
    pub fn of(size: usize) -> Self {
        Committee {
            servers: (0..size).map(|i| NodeId(format!("p{i}"))).collect(),
            keypairs: (0..size).map(|_| generate_keypair()).collect(),
        }
    }

    /// Committee member expected to produce the block at the given height.
    pub fn producer_for(&self, height: i32) -> (&NodeId, &Keypair) {
        let slot = (height - 1).rem_euclid(self.servers.len() as i32) as usize;
        (&self.servers[slot], &self.keypairs[slot])
    }
}

pub fn chain_config(
    dir: &Path,
    committee: &Committee,
    local: usize,
    genesis_time: Timestamp,
    period: Duration,
) -> ChainConfig {
    let genesis = Block::genesis(
        committee.servers[0].clone(),
        genesis_time,
        &committee.keypairs[0],
    )
    .expect("genesis block");
    ChainConfig {
        database_id: DatabaseId("test-db".into()),
        chain_file_prefix: dir.join("chain"),
        data_file: dir.join("data.db"),
        key_path: dir.join("key.toml"),
        server: committee.servers[local].clone(),
        peers: Peers {
            term: 1,
            servers: committee.servers.clone(),
        },
        genesis,
        period,
        query_ttl: 30,
        block_cache_ttl: 30,
        update_period: 5,
        token_type: TokenType::Particle,
        gas_price: 1,
        isolation_level: IsolationLevel::Default,
        rpc_listen: None,
    }
}

pub fn signed_request(keypair: &Keypair, seq_no: u64, millis: i64) -> Request {
    let header = RequestHeader {
        query_type: QueryType::Read,
        node_id: NodeId("client".into()),
        database_id: DatabaseId("test-db".into()),
        connection_id: 1,
        seq_no,
        timestamp: Timestamp::from_millis(millis),
        batch_count: 1,
    };
    Request {
        header: SignedRequestHeader::sign(header, keypair).expect("sign request"),
        queries: vec![Query::new("select * from t")],
    }
}

pub fn query_tx(user: &Keypair, miner: &Keypair, seq_no: u64, millis: i64) -> QueryAsTx {
    let request = signed_request(user, seq_no, millis);
    let response = SignedResponseHeader::sign(
        ResponseHeader {
            request: request.header.header.clone(),
            request_hash: request.hash(),
            node_id: NodeId("miner".into()),
            timestamp: Timestamp::from_millis(millis + 500),
            row_count: 1,
            affected_rows: 0,
            response_account: pub_key_hash(&miner.public),
        },
        miner,
    )
    .expect("sign response");
    QueryAsTx { request, response }
}

/// A rotation-correct block at the given height extending the given parent.
pub fn block_at(
    committee: &Committee,
    genesis: &Block,
    parent_hash: Hash,
    height: i32,
    query_txs: Vec<QueryAsTx>,
) -> Block {
    let (producer, keypair) = committee.producer_for(height);
    let genesis_millis = genesis.timestamp().as_millis();
    let header = Header {
        version: BLOCK_VERSION,
        producer: producer.clone(),
        genesis_hash: genesis.block_hash(),
        parent_hash,
        merkle_root: Hash::default(),
        timestamp: Timestamp::from_millis(genesis_millis + height as i64 * 10_000),
    };
    Block::pack_and_sign(header, Vec::new(), query_txs, Vec::new(), keypair).expect("pack block")
}
