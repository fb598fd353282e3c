use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, DatabaseId, IsolationLevel, NodeId, Peers, TokenType};

/// Floor on the number of recent block bodies kept in memory.
pub const MIN_BLOCK_CACHE_TTL: i32 = 30;

/// Per-instance chain configuration, assembled by the embedding node.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub database_id: DatabaseId,
    /// Prefix for the two on-disk store directories.
    pub chain_file_prefix: PathBuf,
    /// Data file handed to the SQL state on open.
    pub data_file: PathBuf,
    /// Local signing key location; generated when absent.
    pub key_path: PathBuf,
    pub server: NodeId,
    pub peers: Peers,
    pub genesis: Block,
    /// Turn period of the chain clock.
    pub period: Duration,
    /// Query TTL in turns; acks older than head - TTL are expired.
    pub query_ttl: i32,
    /// Number of counts from head to keep block bodies cached.
    pub block_cache_ttl: i32,
    /// Billing window in counts.
    pub update_period: u64,
    pub token_type: TokenType,
    pub gas_price: u64,
    pub isolation_level: IsolationLevel,
    /// Service listen address; `None` leaves registration to the embedder.
    pub rpc_listen: Option<SocketAddr>,
}

impl ChainConfig {
    /// Validates the configuration and clamps `block_cache_ttl` to its floor.
    pub fn validated(mut self) -> ChainResult<Self> {
        if self.period.is_zero() {
            return Err(ChainError::Config("turn period must be non-zero".into()));
        }
        if self.peers.is_empty() {
            return Err(ChainError::Config("peer list must not be empty".into()));
        }
        if self.peers.find(&self.server).is_none() {
            return Err(ChainError::Config(format!(
                "local server {} is not in the peer list",
                self.server
            )));
        }
        if self.update_period == 0 {
            return Err(ChainError::Config("update period must be positive".into()));
        }
        if self.query_ttl <= 0 {
            return Err(ChainError::Config("query TTL must be positive".into()));
        }
        if self.block_cache_ttl < MIN_BLOCK_CACHE_TTL {
            warn!(
                configured = self.block_cache_ttl,
                floor = MIN_BLOCK_CACHE_TTL,
                "block cache TTL below floor, clamping"
            );
            self.block_cache_ttl = MIN_BLOCK_CACHE_TTL;
        }
        Ok(self)
    }

    pub fn block_store_path(&self) -> PathBuf {
        suffixed(&self.chain_file_prefix, "-block-state")
    }

    pub fn query_store_path(&self) -> PathBuf {
        suffixed(&self.chain_file_prefix, "-ack-req-resp")
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
