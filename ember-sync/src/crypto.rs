//! Crypto primitives: Keccak-256, recoverable secp256k1 ECDSA, ECDH, ECIES
//! and the symmetric ciphers used by the RLPx transport.
//!
//! All operations are pure; session state (stream positions, rolling MACs)
//! lives with the transport that owns it.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SECP256K1, SecretKey};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::Keccak256;

/// AES-128-CTR as used by the ECIES envelope.
pub type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
/// AES-256-CTR as used by the RLPx frame stream.
pub type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Errors from signature or envelope operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// secp256k1 rejected a key, signature or recovery id.
    #[error("secp256k1 error. {0}")]
    Secp(#[from] secp256k1::Error),
    /// ECIES input shorter than the fixed envelope layout.
    #[error("ECIES message too short")]
    EciesTruncated,
    /// ECIES authentication tag mismatch.
    #[error("ECIES authentication failed")]
    EciesMac,
}

/// Keccak-256 digest of `data`.
#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Keccak-256 over the concatenation of two inputs.
#[must_use]
pub fn keccak256_two(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);

    hasher.finalize().into()
}

/// Generates a fresh secp256k1 key pair from the thread RNG.
#[must_use]
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    SECP256K1.generate_keypair(&mut rand::thread_rng())
}

/// Signs a 32-byte digest, returning the recovery id and the 64-byte compact
/// `r ‖ s`. libsecp256k1 output is always low-S canonical.
#[must_use]
pub fn sign_recoverable(digest: &[u8; 32], key: &SecretKey) -> (u8, [u8; 64]) {
    let signature = SECP256K1.sign_ecdsa_recoverable(&Message::from_digest(*digest), key);
    let (recovery_id, compact) = signature.serialize_compact();

    (recovery_id.to_i32() as u8, compact)
}

/// Recovers the public key that signed `digest`.
pub fn recover(
    digest: &[u8; 32],
    recovery_id: u8,
    compact: &[u8; 64],
) -> Result<PublicKey, CryptoError> {
    let signature = RecoverableSignature::from_compact(
        compact,
        RecoveryId::from_i32(i32::from(recovery_id))?,
    )?;

    Ok(SECP256K1.recover_ecdsa(&Message::from_digest(*digest), &signature)?)
}

/// ECDH agreement returning the x-coordinate of the shared point.
#[must_use]
pub fn ecdh_agree(public: &PublicKey, secret: &SecretKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(public, secret);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(&point[..32]);

    shared
}

/// HMAC-SHA256 of `data` under `key`.
#[must_use]
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }

    mac.finalize().into_bytes().into()
}

/// NIST SP 800-56 concatenation KDF over SHA-256 with empty other-info.
#[must_use]
pub fn concat_kdf(shared: &[u8; 32], output_len: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(output_len);
    let mut counter = 1u32;
    while output.len() < output_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(shared);
        output.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    output.truncate(output_len);

    output
}

/// Single-block AES-256 encryption of `block`, used for MAC whitening.
#[must_use]
pub fn aes256_encrypt_block(key: &[u8; 32], block: &[u8; 16]) -> [u8; 16] {
    let cipher = aes::Aes256::new(key.into());
    let mut out = (*block).into();
    cipher.encrypt_block(&mut out);

    out.into()
}

// ECIES envelope layout: 0x04 ‖ R(64) ‖ iv(16) ‖ ciphertext ‖ tag(32).
const ECIES_OVERHEAD: usize = 65 + 16 + 32;

/// SEC-1 ECIES encryption to `remote`: AES-128-CTR under a concat-KDF key,
/// authenticated with HMAC-SHA256 over `iv ‖ ciphertext ‖ shared_mac_data`.
#[must_use]
pub fn ecies_encrypt(remote: &PublicKey, plaintext: &[u8], shared_mac_data: &[u8]) -> Vec<u8> {
    let (ephemeral_secret, ephemeral_public) = generate_keypair();
    let shared = ecdh_agree(remote, &ephemeral_secret);
    let derived = concat_kdf(&shared, 32);
    let encryption_key: [u8; 16] = derived[..16].try_into().expect("kdf output is 32 bytes");
    let mac_key = Sha256::digest(&derived[16..]);

    let mut iv = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut iv);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new(&encryption_key.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    let tag = hmac_sha256(&mac_key, &[&iv, &ciphertext, shared_mac_data]);

    let mut out = Vec::with_capacity(ECIES_OVERHEAD + ciphertext.len());
    out.extend_from_slice(&ephemeral_public.serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend(ciphertext);
    out.extend_from_slice(&tag);

    out
}

/// Decrypts an ECIES envelope produced by [`ecies_encrypt`].
pub fn ecies_decrypt(
    secret: &SecretKey,
    message: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if message.len() < ECIES_OVERHEAD {
        return Err(CryptoError::EciesTruncated);
    }
    let (ephemeral, rest) = message.split_at(65);
    let (iv, rest) = rest.split_at(16);
    let (ciphertext, tag) = rest.split_at(rest.len() - 32);

    let ephemeral_public = PublicKey::from_slice(ephemeral)?;
    let shared = ecdh_agree(&ephemeral_public, secret);
    let derived = concat_kdf(&shared, 32);
    let encryption_key: [u8; 16] = derived[..16].try_into().expect("kdf output is 32 bytes");
    let mac_key = Sha256::digest(&derived[16..]);

    let expected = hmac_sha256(&mac_key, &[iv, ciphertext, shared_mac_data]);
    if expected != *tag {
        return Err(CryptoError::EciesMac);
    }

    let mut plaintext = ciphertext.to_vec();
    let iv: [u8; 16] = iv.try_into().expect("split at 16");
    let mut cipher = Aes128Ctr::new(&encryption_key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use secp256k1::{PublicKey, SECP256K1, SecretKey};

    use super::{
        concat_kdf, ecdh_agree, ecies_decrypt, ecies_encrypt, keccak256, recover,
        sign_recoverable,
    };

    fn test_key(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    #[test]
    fn keccak_empty_input() {
        assert_eq!(
            keccak256(&[]),
            hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn sign_then_recover_yields_signer() {
        let key = test_key(7);
        let public = PublicKey::from_secret_key(SECP256K1, &key);
        let digest = keccak256(b"sign me");

        let (recovery_id, compact) = sign_recoverable(&digest, &key);
        assert_eq!(recover(&digest, recovery_id, &compact).unwrap(), public);

        // a different digest must not recover to the same key
        let other = keccak256(b"sign me!");
        assert_ne!(recover(&other, recovery_id, &compact).unwrap(), public);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let (secret_a, public_a) = (test_key(1), PublicKey::from_secret_key(SECP256K1, &test_key(1)));
        let (secret_b, public_b) = (test_key(2), PublicKey::from_secret_key(SECP256K1, &test_key(2)));

        assert_eq!(ecdh_agree(&public_b, &secret_a), ecdh_agree(&public_a, &secret_b));
    }

    #[test]
    fn concat_kdf_lengths() {
        let shared = [0x55u8; 32];
        assert_eq!(concat_kdf(&shared, 16).len(), 16);
        assert_eq!(concat_kdf(&shared, 32).len(), 32);
        assert_eq!(concat_kdf(&shared, 48).len(), 48);
        // prefix property of the counter construction
        assert_eq!(concat_kdf(&shared, 48)[..32], concat_kdf(&shared, 32)[..]);
    }

    #[test]
    fn ecies_round_trip() {
        let secret = test_key(3);
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        let shared_mac_data = [0x01, 0x42];

        let envelope = ecies_encrypt(&public, b"auth body", &shared_mac_data);
        let plaintext = ecies_decrypt(&secret, &envelope, &shared_mac_data).unwrap();
        assert_eq!(plaintext, b"auth body");
    }

    #[test]
    fn ecies_rejects_tampered_ciphertext() {
        let secret = test_key(4);
        let public = PublicKey::from_secret_key(SECP256K1, &secret);

        let mut envelope = ecies_encrypt(&public, b"auth body", &[]);
        let flip = envelope.len() - 40;
        envelope[flip] ^= 0x01;
        assert!(ecies_decrypt(&secret, &envelope, &[]).is_err());
    }

    #[test]
    fn ecies_rejects_wrong_mac_data() {
        let secret = test_key(5);
        let public = PublicKey::from_secret_key(SECP256K1, &secret);

        let envelope = ecies_encrypt(&public, b"auth body", &[0x00, 0x10]);
        assert!(ecies_decrypt(&secret, &envelope, &[0x00, 0x11]).is_err());
    }
}
