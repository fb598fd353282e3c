use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_bytes, merkle_root, public_key_bytes, sign_hash, verify_hash};
use crate::errors::{ChainError, ChainResult};

use super::{Hash, NodeId, PublicKeyBytes, Request, SignatureBytes, SignedAckHeader,
    SignedResponseHeader, Timestamp};

pub const BLOCK_VERSION: u32 = 0x0100_0000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub producer: NodeId,
    pub genesis_hash: Hash,
    pub parent_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: Timestamp,
}

impl Header {
    pub fn compute_hash(&self) -> ChainResult<Hash> {
        let encoded = rmp_serde::to_vec(self)?;
        Ok(hash_bytes(&encoded))
    }
}

/// Header plus producer signature. The header hash is the block identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeader {
    pub header: Header,
    pub hash: Hash,
    pub signee: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl SignedHeader {
    pub fn verify(&self) -> ChainResult<()> {
        if self.header.compute_hash()? != self.hash {
            return Err(ChainError::InvalidBlock);
        }
        verify_hash(&self.signee, &self.hash, &self.signature)
    }
}

/// A completed query packed into a block: the client request paired with the
/// signed response header the serving miner produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAsTx {
    pub request: Request,
    pub response: SignedResponseHeader,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub signed_header: SignedHeader,
    /// Requests rejected before execution, still billable.
    pub failed_reqs: Vec<Request>,
    pub query_txs: Vec<QueryAsTx>,
    pub acks: Vec<SignedAckHeader>,
}

impl Block {
    /// Computes the body merkle root, fills it into the header, hashes and
    /// signs. Blocks are immutable once packed.
    pub fn pack_and_sign(
        mut header: Header,
        failed_reqs: Vec<Request>,
        query_txs: Vec<QueryAsTx>,
        acks: Vec<SignedAckHeader>,
        keypair: &Keypair,
    ) -> ChainResult<Block> {
        header.merkle_root = body_merkle(&failed_reqs, &query_txs, &acks);
        let hash = header.compute_hash()?;
        Ok(Block {
            signed_header: SignedHeader {
                signature: sign_hash(keypair, &hash),
                signee: public_key_bytes(&keypair.public),
                header,
                hash,
            },
            failed_reqs,
            query_txs,
            acks,
        })
    }

    /// Produces the configured genesis block: empty body, zero parent.
    pub fn genesis(producer: NodeId, timestamp: Timestamp, keypair: &Keypair) -> ChainResult<Block> {
        let header = Header {
            version: BLOCK_VERSION,
            producer,
            genesis_hash: Hash::default(),
            parent_hash: Hash::default(),
            merkle_root: Hash::default(),
            timestamp,
        };
        Block::pack_and_sign(header, Vec::new(), Vec::new(), Vec::new(), keypair)
    }

    pub fn verify(&self) -> ChainResult<()> {
        if body_merkle(&self.failed_reqs, &self.query_txs, &self.acks)
            != self.signed_header.header.merkle_root
        {
            return Err(ChainError::InvalidBlock);
        }
        self.signed_header.verify()
    }

    pub fn verify_as_genesis(&self) -> ChainResult<()> {
        if self.signed_header.header.parent_hash != Hash::default() {
            return Err(ChainError::InvalidBlock);
        }
        self.verify()
    }

    pub fn block_hash(&self) -> Hash {
        self.signed_header.hash
    }

    pub fn producer(&self) -> &NodeId {
        &self.signed_header.header.producer
    }

    pub fn signee(&self) -> &PublicKeyBytes {
        &self.signed_header.signee
    }

    pub fn parent_hash(&self) -> Hash {
        self.signed_header.header.parent_hash
    }

    pub fn genesis_hash(&self) -> Hash {
        self.signed_header.header.genesis_hash
    }

    pub fn timestamp(&self) -> Timestamp {
        self.signed_header.header.timestamp
    }

    /// Next SQL state sequence implied by the packed queries, if any.
    pub fn calc_next_seq(&self) -> Option<u64> {
        self.query_txs
            .iter()
            .map(|tx| tx.request.header.header.seq_no)
            .max()
            .map(|seq| seq + 1)
    }
}

fn body_merkle(
    failed_reqs: &[Request],
    query_txs: &[QueryAsTx],
    acks: &[SignedAckHeader],
) -> Hash {
    let mut leaves = Vec::with_capacity(failed_reqs.len() + query_txs.len() + acks.len());
    leaves.extend(failed_reqs.iter().map(Request::hash));
    leaves.extend(query_txs.iter().map(|tx| tx.response.hash));
    leaves.extend(acks.iter().map(|ack| ack.hash));
    merkle_root(&leaves)
}
