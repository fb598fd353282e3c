use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_bytes, public_key_bytes, sign_hash, verify_hash};
use crate::errors::{ChainError, ChainResult};

use super::{Address, DatabaseId, Hash, NodeId, PublicKeyBytes, SignatureBytes, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    Read,
    Write,
}

/// A single SQL statement with its placeholder arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub pattern: String,
    pub args: Vec<String>,
}

impl Query {
    pub fn new(pattern: impl Into<String>) -> Self {
        Query {
            pattern: pattern.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub query_type: QueryType,
    pub node_id: NodeId,
    pub database_id: DatabaseId,
    pub connection_id: u64,
    pub seq_no: u64,
    pub timestamp: Timestamp,
    /// Number of queries carried by the request payload. Kept in the signed
    /// header so billing can charge rejected requests without the payload.
    pub batch_count: u64,
}

impl RequestHeader {
    pub fn compute_hash(&self) -> ChainResult<Hash> {
        let encoded = rmp_serde::to_vec(self)?;
        Ok(hash_bytes(&encoded))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequestHeader {
    pub header: RequestHeader,
    pub hash: Hash,
    pub signee: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl SignedRequestHeader {
    pub fn sign(header: RequestHeader, keypair: &Keypair) -> ChainResult<Self> {
        let hash = header.compute_hash()?;
        Ok(SignedRequestHeader {
            signature: sign_hash(keypair, &hash),
            signee: public_key_bytes(&keypair.public),
            header,
            hash,
        })
    }

    pub fn verify(&self) -> ChainResult<()> {
        if self.header.compute_hash()? != self.hash {
            return Err(ChainError::Crypto("request header hash mismatch".into()));
        }
        verify_hash(&self.signee, &self.hash, &self.signature)
    }
}

/// A signed client request together with its query payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub header: SignedRequestHeader,
    pub queries: Vec<Query>,
}

impl Request {
    pub fn timestamp(&self) -> Timestamp {
        self.header.header.timestamp
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub request: RequestHeader,
    pub request_hash: Hash,
    /// Miner that served the query.
    pub node_id: NodeId,
    pub timestamp: Timestamp,
    pub row_count: u64,
    pub affected_rows: u64,
    /// Account credited with the income for this query.
    pub response_account: Address,
}

impl ResponseHeader {
    pub fn compute_hash(&self) -> ChainResult<Hash> {
        let encoded = rmp_serde::to_vec(self)?;
        Ok(hash_bytes(&encoded))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResponseHeader {
    pub header: ResponseHeader,
    pub hash: Hash,
    pub signee: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl SignedResponseHeader {
    pub fn sign(header: ResponseHeader, keypair: &Keypair) -> ChainResult<Self> {
        let hash = header.compute_hash()?;
        Ok(SignedResponseHeader {
            signature: sign_hash(keypair, &hash),
            signee: public_key_bytes(&keypair.public),
            header,
            hash,
        })
    }

    pub fn verify(&self) -> ChainResult<()> {
        if self.header.compute_hash()? != self.hash {
            return Err(ChainError::Crypto("response header hash mismatch".into()));
        }
        verify_hash(&self.signee, &self.hash, &self.signature)
    }

    pub fn request_timestamp(&self) -> Timestamp {
        self.header.request.timestamp
    }

    pub fn response_timestamp(&self) -> Timestamp {
        self.header.timestamp
    }
}

/// Query result rows returned to the client alongside the signed header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub header: Option<SignedResponseHeader>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHeader {
    pub response: ResponseHeader,
    pub response_hash: Hash,
    /// Client node confirming receipt.
    pub node_id: NodeId,
    pub timestamp: Timestamp,
}

impl AckHeader {
    pub fn compute_hash(&self) -> ChainResult<Hash> {
        let encoded = rmp_serde::to_vec(self)?;
        Ok(hash_bytes(&encoded))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAckHeader {
    pub header: AckHeader,
    pub hash: Hash,
    pub signee: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl SignedAckHeader {
    pub fn sign(header: AckHeader, keypair: &Keypair) -> ChainResult<Self> {
        let hash = header.compute_hash()?;
        Ok(SignedAckHeader {
            signature: sign_hash(keypair, &hash),
            signee: public_key_bytes(&keypair.public),
            header,
            hash,
        })
    }

    pub fn verify(&self) -> ChainResult<()> {
        if self.header.compute_hash()? != self.hash {
            return Err(ChainError::Crypto("ack header hash mismatch".into()));
        }
        verify_hash(&self.signee, &self.hash, &self.signature)
    }

    pub fn request_timestamp(&self) -> Timestamp {
        self.header.response.request.timestamp
    }

    pub fn response_timestamp(&self) -> Timestamp {
        self.header.response.timestamp
    }

    pub fn response_hash(&self) -> Hash {
        self.header.response_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn request_header() -> RequestHeader {
        RequestHeader {
            query_type: QueryType::Read,
            node_id: NodeId("node-0".into()),
            database_id: DatabaseId("db".into()),
            connection_id: 1,
            seq_no: 7,
            timestamp: Timestamp::from_millis(10_000),
            batch_count: 1,
        }
    }

    #[test]
    fn signed_request_header_roundtrip() {
        let keypair = generate_keypair();
        let signed = SignedRequestHeader::sign(request_header(), &keypair).unwrap();
        signed.verify().unwrap();
    }

    #[test]
    fn tampered_request_header_fails_verification() {
        let keypair = generate_keypair();
        let mut signed = SignedRequestHeader::sign(request_header(), &keypair).unwrap();
        signed.header.seq_no += 1;
        assert!(matches!(signed.verify(), Err(ChainError::Crypto(_))));
    }

    #[test]
    fn ack_exposes_both_timestamps() {
        let keypair = generate_keypair();
        let request = request_header();
        let response = ResponseHeader {
            request: request.clone(),
            request_hash: request.compute_hash().unwrap(),
            node_id: NodeId("node-1".into()),
            timestamp: Timestamp::from_millis(12_000),
            row_count: 3,
            affected_rows: 0,
            response_account: Address::default(),
        };
        let signed_response = SignedResponseHeader::sign(response.clone(), &keypair).unwrap();
        let ack = SignedAckHeader::sign(
            AckHeader {
                response,
                response_hash: signed_response.hash,
                node_id: NodeId("client".into()),
                timestamp: Timestamp::from_millis(12_500),
            },
            &keypair,
        )
        .unwrap();
        ack.verify().unwrap();
        assert_eq!(ack.request_timestamp(), Timestamp::from_millis(10_000));
        assert_eq!(ack.response_timestamp(), Timestamp::from_millis(12_000));
        assert_eq!(ack.response_hash(), signed_response.hash);
    }
}
