use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::chain::Chain;
use crate::crypto::{database_address, pub_key_bytes_hash};
use crate::errors::ChainResult;
use crate::index::BlockNode;
use crate::types::{Address, MinerIncome, QueryType, UpdateBillingHeader, UserCost};

impl Chain {
    /// Sweeps the billing window ending at the given node: up to
    /// `update_period` blocks walked via parent pointers, evicted bodies
    /// recovered from the block store.
    ///
    /// Read queries are billed by row count, writes by affected rows, and
    /// rejected requests by their query count against the block producer.
    /// Users and per-user miners accumulate in ordered maps so the emitted
    /// update is stable.
    pub(crate) fn build_billing(&self, node: &Arc<BlockNode>) -> ChainResult<UpdateBillingHeader> {
        debug!(
            db = %self.database_id(),
            count = node.count(),
            "begin billing window"
        );
        let mut users: BTreeMap<Address, u64> = BTreeMap::new();
        let mut miners: BTreeMap<Address, BTreeMap<Address, u64>> = BTreeMap::new();

        let mut current = Some(Arc::clone(node));
        let mut walked = 0u64;
        while walked < self.config().update_period {
            let Some(node) = current else { break };
            let block = match node.cached_block() {
                Some(block) => block,
                None => Arc::new(self.load_block_body(&node)?),
            };

            for tx in &block.query_txs {
                let miner = tx.response.header.response_account;
                let user = pub_key_bytes_hash(&tx.request.header.signee);
                let amount = match tx.request.header.header.query_type {
                    QueryType::Read => tx.response.header.row_count,
                    QueryType::Write => tx.response.header.affected_rows,
                };
                *users.entry(user).or_default() += amount;
                *miners.entry(user).or_default().entry(miner).or_default() += amount;
            }

            for req in &block.failed_reqs {
                let miner = pub_key_bytes_hash(block.signee());
                let user = pub_key_bytes_hash(&req.header.signee);
                let amount = req.queries.len() as u64;
                *users.entry(user).or_default() += amount;
                *miners.entry(user).or_default().entry(miner).or_default() += amount;
            }

            current = node.parent();
            walked += 1;
        }

        let users = users
            .into_iter()
            .map(|(user, cost)| UserCost {
                user,
                cost,
                miners: miners
                    .remove(&user)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(miner, income)| MinerIncome { miner, income })
                    .collect(),
            })
            .collect();

        Ok(UpdateBillingHeader {
            receiver: database_address(self.database_id()),
            users,
            nonce: 0,
        })
    }
}
