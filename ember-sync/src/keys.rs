//! Account key handling.
//!
//! Key derivation from a mnemonic is out of scope; the engine takes an
//! already-derived 32-byte secp256k1 secret.

use secp256k1::{PublicKey, SECP256K1, SecretKey};

use crate::crypto::keccak256;
use crate::primitives::Address;

/// Errors constructing an account key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The 32 bytes are not a valid secp256k1 scalar.
    #[error("invalid secret key. {0}")]
    InvalidSecretKey(#[from] secp256k1::Error),
}

/// The account's signing key with its derived public identity.
#[derive(Debug, Clone)]
pub struct AccountKey {
    secret: SecretKey,
    public: PublicKey,
}

impl AccountKey {
    /// Builds an account key from a raw 32-byte secret.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(SECP256K1, &secret);

        Ok(Self { secret, public })
    }

    /// The signing key.
    #[must_use]
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// The secp256k1 public key.
    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The 64-byte uncompressed public key without the 0x04 prefix, as used
    /// for the devp2p node id.
    #[must_use]
    pub fn node_id(&self) -> [u8; 64] {
        let serialized = self.public.serialize_uncompressed();
        let mut id = [0u8; 64];
        id.copy_from_slice(&serialized[1..]);

        id
    }

    /// The account address: last 20 bytes of keccak over the public key.
    #[must_use]
    pub fn address(&self) -> Address {
        public_key_address(&self.public)
    }
}

/// Derives the address of any secp256k1 public key.
#[must_use]
pub fn public_key_address(public: &PublicKey) -> Address {
    let digest = keccak256(&public.serialize_uncompressed()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);

    Address::new(address)
}
