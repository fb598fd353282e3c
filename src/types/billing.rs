use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_bytes, public_key_bytes, sign_hash, verify_hash};
use crate::errors::{ChainError, ChainResult};

use super::{Address, Hash, PublicKeyBytes, SignatureBytes};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerIncome {
    pub miner: Address,
    pub income: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCost {
    pub user: Address,
    pub cost: u64,
    pub miners: Vec<MinerIncome>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBillingHeader {
    /// Account of the billed database.
    pub receiver: Address,
    /// Per-user costs, address ascending; miners within each user are also
    /// address ascending so the emitted transaction is stable.
    pub users: Vec<UserCost>,
    pub nonce: u64,
}

/// Signed billing update submitted to the main chain as a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBilling {
    pub header: UpdateBillingHeader,
    pub hash: Hash,
    pub signee: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl UpdateBillingHeader {
    pub fn compute_hash(&self) -> ChainResult<Hash> {
        let encoded = rmp_serde::to_vec(self)?;
        Ok(hash_bytes(&encoded))
    }

    pub fn sign(self, keypair: &Keypair) -> ChainResult<UpdateBilling> {
        let hash = self.compute_hash()?;
        Ok(UpdateBilling {
            signature: sign_hash(keypair, &hash),
            signee: public_key_bytes(&keypair.public),
            header: self,
            hash,
        })
    }
}

impl UpdateBilling {
    pub fn verify(&self) -> ChainResult<()> {
        if self.header.compute_hash()? != self.hash {
            return Err(ChainError::Crypto("billing header hash mismatch".into()));
        }
        verify_hash(&self.signee, &self.hash, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn signed_update_verifies_until_tampered() {
        let keypair = generate_keypair();
        let header = UpdateBillingHeader {
            receiver: Address([1u8; 32]),
            users: vec![UserCost {
                user: Address([2u8; 32]),
                cost: 13,
                miners: vec![
                    MinerIncome {
                        miner: Address([3u8; 32]),
                        income: 10,
                    },
                    MinerIncome {
                        miner: Address([4u8; 32]),
                        income: 3,
                    },
                ],
            }],
            nonce: 9,
        };
        let mut update = header.sign(&keypair).unwrap();
        update.verify().unwrap();
        update.header.users[0].cost = 14;
        assert!(update.verify().is_err());
    }
}
