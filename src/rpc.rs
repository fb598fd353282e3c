use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;
use crate::types::{Address, Block, DatabaseId, NodeId, UpdateBilling};

/// A peer pushing a newly produced block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdviseNewBlockReq {
    pub database_id: DatabaseId,
    pub block: Block,
    /// Count of the advised block on the producer's chain, -1 if unknown.
    pub count: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdviseNewBlockResp {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchBlockReq {
    pub database_id: DatabaseId,
    pub height: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchBlockResp {
    /// Block at the latest ancestor height <= the requested height, if any.
    pub block: Option<Block>,
    pub count: i32,
    pub height: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NextAccountNonceReq {
    pub addr: Address,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NextAccountNonceResp {
    pub nonce: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddTxReq {
    pub tx: UpdateBilling,
    pub ttl: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddTxResp {}

/// Outbound calls to committee peers. The transport is external; the engine
/// only fans out advises and fetches missing head blocks.
#[async_trait]
pub trait PeerCaller: Send + Sync {
    async fn advise_new_block(
        &self,
        node: &NodeId,
        req: AdviseNewBlockReq,
    ) -> ChainResult<AdviseNewBlockResp>;

    async fn fetch_block(&self, node: &NodeId, req: FetchBlockReq) -> ChainResult<FetchBlockResp>;
}

/// Outbound calls to the main-chain block producer, used by billing.
#[async_trait]
pub trait MainChainClient: Send + Sync {
    async fn next_account_nonce(
        &self,
        req: NextAccountNonceReq,
    ) -> ChainResult<NextAccountNonceResp>;

    async fn add_tx(&self, req: AddTxReq) -> ChainResult<AddTxResp>;
}
