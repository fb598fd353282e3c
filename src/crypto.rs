use std::fs;
use std::path::Path;

use blake2::digest::Digest;
use blake2::Blake2s256;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, DatabaseId, Hash, PublicKeyBytes, SignatureBytes};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeypair {
    public_key: String,
    secret_key: String,
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.public_key)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn hash_bytes(data: &[u8]) -> Hash {
    Hash(Blake2s256::digest(data).into())
}

/// Hash of a pair of digests, used to fold merkle levels.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Blake2s256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash(hasher.finalize().into())
}

pub fn pub_key_hash(public: &PublicKey) -> Address {
    Address(Blake2s256::digest(public.as_bytes()).into())
}

pub fn pub_key_bytes_hash(public: &PublicKeyBytes) -> Address {
    Address(Blake2s256::digest(public.0).into())
}

/// Account address receiving billing updates for a database.
pub fn database_address(id: &DatabaseId) -> Address {
    Address(Blake2s256::digest(id.0.as_bytes()).into())
}

pub fn public_key_bytes(public: &PublicKey) -> PublicKeyBytes {
    PublicKeyBytes(public.to_bytes())
}

pub fn sign_hash(keypair: &Keypair, hash: &Hash) -> SignatureBytes {
    SignatureBytes(keypair.sign(hash.as_bytes()).to_bytes())
}

pub fn verify_hash(
    public: &PublicKeyBytes,
    hash: &Hash,
    signature: &SignatureBytes,
) -> ChainResult<()> {
    let public = PublicKey::from_bytes(&public.0)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))?;
    let signature = Signature::from_bytes(&signature.0)
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))?;
    public
        .verify(hash.as_bytes(), &signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// Merkle root over a list of leaf digests. Odd leaves are paired with
/// themselves; an empty list hashes a fixed domain tag.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return hash_bytes(b"sqlchain-empty");
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next.push(hash_pair(left, right));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keypair_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("keys/node.toml");
        let generated = load_or_generate_keypair(&path).unwrap();
        let reloaded = load_or_generate_keypair(&path).unwrap();
        assert_eq!(generated.public.to_bytes(), reloaded.public.to_bytes());
        assert_eq!(generated.secret.to_bytes(), reloaded.secret.to_bytes());
    }

    #[test]
    fn signature_roundtrip() {
        let keypair = generate_keypair();
        let digest = hash_bytes(b"payload");
        let signature = sign_hash(&keypair, &digest);
        verify_hash(&public_key_bytes(&keypair.public), &digest, &signature).unwrap();

        let other = hash_bytes(b"other payload");
        assert!(verify_hash(&public_key_bytes(&keypair.public), &other, &signature).is_err());
    }

    #[test]
    fn merkle_root_is_order_sensitive() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        let c = hash_bytes(b"c");
        assert_ne!(merkle_root(&[a, b, c]), merkle_root(&[b, a, c]));
        assert_eq!(merkle_root(&[a]), a);
        assert_ne!(merkle_root(&[]), merkle_root(&[a]));
    }
}
