use std::path::Path;

use rocksdb::{DBCompressionType, Direction, IteratorMode, Options, DB};

use crate::errors::ChainResult;
use crate::types::Hash;

pub const BLOCK_TAG: [u8; 4] = *b"BLCK";
pub const RESPONSE_TAG: [u8; 4] = *b"RESP";
pub const ACK_TAG: [u8; 4] = *b"QACK";
/// Reserved for request persistence; no writer yet.
pub const REQUEST_TAG: [u8; 4] = *b"REQU";

/// Builds a store key: four-byte tag, big-endian height, record hash.
/// The layout keeps prefix scans in height order.
pub fn tagged_key(tag: [u8; 4], height: i32, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 4 + 32);
    key.extend_from_slice(&tag);
    key.extend_from_slice(&(height as u32).to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Recovers the height encoded in bytes 4..8 of a tagged key.
pub fn key_height(key: &[u8]) -> i32 {
    if key.len() < 8 {
        return -1;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&key[4..8]);
    u32::from_be_bytes(raw) as i32
}

/// Append-mostly key/value store backing one chain namespace.
pub struct KvStore {
    db: DB,
}

impl KvStore {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Snappy);
        let db = DB::open(&opts, path)?;
        Ok(KvStore { db })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> ChainResult<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// All entries under a tag, ascending by key (height, then hash).
    pub fn scan_tag(&self, tag: [u8; 4]) -> ChainResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(&tag, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&tag) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Flushes memtables; the handle releases file resources on drop.
    pub fn close(&self) -> ChainResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
