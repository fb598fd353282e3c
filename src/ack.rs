use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Hash, SignedAckHeader, SignedResponseHeader};

#[derive(Default)]
struct AckBucket {
    responses: HashMap<Hash, SignedResponseHeader>,
    acks: BTreeMap<Hash, SignedAckHeader>,
}

/// Height-bucketed index of responses awaiting acknowledgement and of
/// registered acks awaiting block inclusion.
///
/// Mutated from the ingest loop and from RPC handlers; all mutations are
/// serialized behind one lock.
#[derive(Default)]
pub struct AckIndex {
    buckets: Mutex<BTreeMap<i32, AckBucket>>,
    response_count: AtomicI32,
    ack_count: AtomicI32,
}

impl AckIndex {
    pub fn new() -> Self {
        AckIndex::default()
    }

    /// Records a response in its request-height bucket, awaiting an ack.
    /// Idempotent by response hash.
    pub fn add_response(&self, height: i32, response: SignedResponseHeader) -> ChainResult<()> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(height).or_default();
        if bucket.responses.insert(response.hash, response).is_none() {
            self.response_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Associates an ack with a previously seen response in the same bucket.
    pub fn register(&self, height: i32, ack: SignedAckHeader) -> ChainResult<()> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .get_mut(&height)
            .ok_or(ChainError::ResponseNotFound)?;
        let response = bucket
            .responses
            .get(&ack.response_hash())
            .ok_or(ChainError::ResponseNotFound)?;
        if response.header != ack.header.response {
            return Err(ChainError::Crypto(
                "ack does not match the recorded response".into(),
            ));
        }
        if bucket.acks.insert(ack.hash, ack).is_none() {
            self.ack_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Deletes an ack once a block has included it, completing billing.
    pub fn remove(&self, height: i32, ack: &SignedAckHeader) -> ChainResult<()> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .get_mut(&height)
            .ok_or(ChainError::ResponseNotFound)?;
        bucket
            .acks
            .remove(&ack.hash)
            .ok_or(ChainError::ResponseNotFound)?;
        self.ack_count.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of every registered ack in buckets strictly below the given
    /// height, ordered by height then ack hash so block packing is
    /// deterministic.
    pub fn acks(&self, height: i32) -> Vec<SignedAckHeader> {
        let buckets = self.buckets.lock();
        buckets
            .range(..height)
            .flat_map(|(_, bucket)| bucket.acks.values().cloned())
            .collect()
    }

    /// Drops every bucket below the minimum valid height; acks in dropped
    /// buckets are expired.
    pub fn advance(&self, min_valid: i32) {
        let mut buckets = self.buckets.lock();
        let keep = buckets.split_off(&min_valid);
        let dropped = std::mem::replace(&mut *buckets, keep);
        if dropped.is_empty() {
            return;
        }
        let mut responses = 0;
        let mut acks = 0;
        for bucket in dropped.values() {
            responses += bucket.responses.len() as i32;
            acks += bucket.acks.len() as i32;
        }
        self.response_count.fetch_sub(responses, Ordering::Relaxed);
        self.ack_count.fetch_sub(acks, Ordering::Relaxed);
        debug!(
            min_valid,
            buckets = dropped.len(),
            responses,
            acks,
            "dropped expired ack buckets"
        );
    }

    pub fn response_count(&self) -> i32 {
        self.response_count.load(Ordering::Relaxed)
    }

    pub fn ack_count(&self) -> i32 {
        self.ack_count.load(Ordering::Relaxed)
    }
}
