use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, QueryAsTx, Request, Response, SignedResponseHeader};

/// Contract the chain engine consumes from the transactional SQL backend.
///
/// The backend owns its own locking and sequencing; the engine only drives
/// commits, deterministic replay, and the sequence counter restored at
/// startup.
#[async_trait]
pub trait SqlState: Send + Sync {
    /// Executes a query against local state and returns a tracker for the
    /// in-flight commit alongside the client-facing response.
    async fn query(&self, request: Request, is_leader: bool)
        -> ChainResult<(QueryTracker, Response)>;

    /// Commits the current period: requests rejected before execution plus
    /// trackers for every query awaiting block inclusion.
    fn commit(&self) -> ChainResult<(Vec<Request>, Vec<QueryTracker>)>;

    /// Deterministically applies a remote block's failed requests and query
    /// transactions.
    async fn replay_block(&self, block: &Block) -> ChainResult<()>;

    /// Reinitializes the query sequence after startup replay.
    fn set_seq(&self, seq: u64);

    fn close(&self, drop_data: bool) -> ChainResult<()>;
}

struct TrackerInner {
    request: Request,
    response: RwLock<Option<SignedResponseHeader>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

/// Handle for an in-flight query produced by the SQL state.
///
/// Created on query, flagged ready once the backend has committed, and
/// consumed when packed into a block. Readiness is a watch channel, so block
/// production can wait without polling.
#[derive(Clone)]
pub struct QueryTracker {
    inner: Arc<TrackerInner>,
}

impl QueryTracker {
    pub fn new(request: Request) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        QueryTracker {
            inner: Arc::new(TrackerInner {
                request,
                response: RwLock::new(None),
                ready_tx,
                ready_rx,
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn ready(&self) -> bool {
        *self.inner.ready_rx.borrow()
    }

    /// Marks the tracked query committed. Called by the SQL state.
    pub fn complete(&self, response: SignedResponseHeader) {
        *self.inner.response.write() = Some(response);
        let _ = self.inner.ready_tx.send(true);
    }

    /// Waits for the commit signal, honouring cancellation.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> ChainResult<()> {
        let mut ready = self.inner.ready_rx.clone();
        loop {
            if *ready.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = ready.changed() => {
                    changed.map_err(|_| ChainError::State("query tracker closed".into()))?;
                }
                _ = cancel.cancelled() => return Err(ChainError::Cancelled),
            }
        }
    }

    /// The request/response pair, available once ready.
    pub fn query_tx(&self) -> ChainResult<QueryAsTx> {
        let response = self
            .inner
            .response
            .read()
            .clone()
            .ok_or_else(|| ChainError::State("query tracker not ready".into()))?;
        Ok(QueryAsTx {
            request: self.inner.request.clone(),
            response,
        })
    }
}
