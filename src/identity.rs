//! Seed-derived agent identity.
//!
//! One 32-byte [`MasterSeed`] yields two independent keypairs:
//!
//! - an Ed25519 signing key whose public half is the agent's [`NodeId`] on the
//!   discovery and messaging layers;
//! - a secp256k1 payment key that controls the agent's settlement account and is
//!   only ever exposed as its EVM address.
//!
//! Derivation is a pure function: the same seed always produces the same identity.

use crate::{
    error::{HyphaError, Result},
    validation::to_checksum_address,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SEED_LEN: usize = 32;
pub const NODE_ID_LEN: usize = 32;
/// Width of the identifier used by the DHT routing layer.
pub const DHT_ID_LEN: usize = 20;

const P2P_TAG: &[u8] = b"hypha.p2p";
const WALLET_TAG: &[u8] = b"hypha.wallet";

/// The root secret of an agent.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSeed([u8; SEED_LEN]);

impl MasterSeed {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; SEED_LEN] = bytes.try_into().map_err(|_| HyphaError::InvalidSeedLength {
            expected: SEED_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(seed))
    }

    pub fn random() -> Self {
        let mut seed = [0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self(seed)
    }

    /// Parse a 64-character hex seed, with or without a `0x` prefix.
    pub fn from_hex(hex_seed: &str) -> Result<Self> {
        let trimmed = hex_seed.trim().trim_start_matches("0x").trim_start_matches("0X");
        let bytes = hex::decode(trimmed)?;
        Self::from_bytes(&bytes)
    }

    /// One-way hash of an arbitrary passphrase into a seed.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        let passphrase = crate::validation::validate_passphrase(passphrase)?;
        let digest = Sha256::digest(passphrase.as_bytes());
        Ok(Self(digest.into()))
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSeed(<redacted>)")
    }
}

/// Public identifier of an agent: its raw Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for logs and dashboards. Never use it for addressing.
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }

    /// Truncated identifier for the DHT, taken from the same key material.
    pub fn dht_bytes(&self) -> [u8; DHT_ID_LEN] {
        let mut out = [0u8; DHT_ID_LEN];
        out.copy_from_slice(&self.0[..DHT_ID_LEN]);
        out
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| HyphaError::InvalidKey(e.to_string()))
    }
}

impl FromStr for NodeId {
    type Err = HyphaError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let id: [u8; NODE_ID_LEN] = bytes.as_slice().try_into().map_err(|_| {
            HyphaError::Validation(format!(
                "node id must be {} bytes, got {}",
                NODE_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Payment keypair. The secret never leaves the process; only [`WalletKeypair::address`] is shared.
pub struct WalletKeypair {
    secret: secp256k1::SecretKey,
    public: secp256k1::PublicKey,
    address: String,
}

impl WalletKeypair {
    fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let secret = secp256k1::SecretKey::from_slice(seed)
            .map_err(|e| HyphaError::InvalidKey(format!("wallet key: {}", e)))?;
        let public = secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, &secret);

        let uncompressed = public.serialize_uncompressed();
        let hash = Keccak256::digest(&uncompressed[1..]);
        let address = to_checksum_address(&hex::encode(&hash[12..]));

        Ok(Self { secret, public, address })
    }

    /// EIP-55 checksummed EVM address.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> &secp256k1::PublicKey {
        &self.public
    }

    /// Raw secret for handing to an external wallet backend.
    pub fn secret_key(&self) -> &secp256k1::SecretKey {
        &self.secret
    }
}

/// Everything an agent derives from its master seed.
pub struct Identity {
    signing_key: SigningKey,
    node_id: NodeId,
    wallet: WalletKeypair,
}

impl Identity {
    /// Derive from raw seed bytes. Fails with `InvalidSeedLength` unless exactly 32 bytes.
    pub fn derive(master_seed: &[u8]) -> Result<Self> {
        let seed = MasterSeed::from_bytes(master_seed)?;
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &MasterSeed) -> Result<Self> {
        let mut signing_seed = domain_hash(seed, P2P_TAG);
        let mut wallet_seed = domain_hash(seed, WALLET_TAG);

        let signing_key = SigningKey::from_bytes(&signing_seed);
        let node_id = NodeId(signing_key.verifying_key().to_bytes());
        let wallet = WalletKeypair::from_seed(&wallet_seed);

        signing_seed.zeroize();
        wallet_seed.zeroize();

        Ok(Self {
            signing_key,
            node_id,
            wallet: wallet?,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn wallet(&self) -> &WalletKeypair {
        &self.wallet
    }

    pub fn wallet_address(&self) -> &str {
        self.wallet.address()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .field("wallet_address", &self.wallet.address)
            .finish_non_exhaustive()
    }
}

fn domain_hash(seed: &MasterSeed, tag: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(tag);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let seed = [7u8; 32];
        let a = Identity::derive(&seed).unwrap();
        let b = Identity::derive(&seed).unwrap();
        assert_eq!(a.node_id(), b.node_id());
        assert_eq!(a.wallet_address(), b.wallet_address());
    }

    #[test]
    fn test_distinct_seeds_diverge() {
        let a = Identity::derive(&[1u8; 32]).unwrap();
        let b = Identity::derive(&[2u8; 32]).unwrap();
        assert_ne!(a.node_id(), b.node_id());
        assert_ne!(a.wallet_address(), b.wallet_address());
    }

    #[test]
    fn test_invalid_seed_length() {
        match Identity::derive(&[0u8; 31]) {
            Err(HyphaError::InvalidSeedLength { expected, actual }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 31);
            }
            other => panic!("Expected InvalidSeedLength, got {other:?}"),
        }
        assert!(MasterSeed::from_bytes(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_node_id_is_signing_public_key() {
        let identity = Identity::derive(&[9u8; 32]).unwrap();
        assert_eq!(
            identity.node_id().as_bytes(),
            &identity.verifying_key().to_bytes()
        );
        assert_eq!(&identity.node_id().dht_bytes()[..], &identity.node_id().as_bytes()[..20]);
        assert_eq!(identity.node_id().short().len(), 16);
    }

    #[test]
    fn test_wallet_address_shape() {
        let identity = Identity::derive(&[3u8; 32]).unwrap();
        let address = identity.wallet_address();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert!(crate::validation::validate_ethereum_address(address, "wallet").is_ok());
    }

    #[test]
    fn test_passphrase_and_hex_seeds() {
        let from_phrase = MasterSeed::from_passphrase("groot-hypha-agent-v1").unwrap();
        let from_hex = MasterSeed::from_hex(&from_phrase.to_hex()).unwrap();
        assert_eq!(from_phrase.as_bytes(), from_hex.as_bytes());
        assert!(MasterSeed::from_passphrase("short").is_err());
        assert!(MasterSeed::from_hex("abcd").is_err());
    }

    #[test]
    fn test_node_id_hex_roundtrip_and_serde() {
        let identity = Identity::derive(&[4u8; 32]).unwrap();
        let id = identity.node_id();
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_seed_debug_is_redacted() {
        let seed = MasterSeed::from_bytes(&[0xAB; 32]).unwrap();
        let printed = format!("{:?}", seed);
        assert!(!printed.contains("ab"));
        assert!(printed.contains("redacted"));
    }
}
