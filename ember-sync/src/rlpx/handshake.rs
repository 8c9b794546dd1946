//! The RLPx auth/ack handshake (initiator side) and secret derivation.

use rand::Rng;
use secp256k1::{PublicKey, SECP256K1, SecretKey};
use sha3::{Digest, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{
    CryptoError, ecdh_agree, ecies_decrypt, ecies_encrypt, generate_keypair, keccak256_two,
    sign_recoverable,
};
use crate::error::ProtocolError;
use crate::rlp;
use crate::rlpx::Secrets;

const AUTH_VSN: u64 = 4;

/// Runs the EIP-8 handshake as initiator over `stream`, returning the
/// derived session secrets.
pub async fn initiate<S>(
    stream: &mut S,
    static_key: &SecretKey,
    remote_public: &PublicKey,
) -> Result<Secrets, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (ephemeral_secret, _ephemeral_public) = generate_keypair();
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill(&mut nonce);

    let auth_message = auth_message(static_key, &ephemeral_secret, &nonce, remote_public);
    stream.write_all(&auth_message).await?;

    let mut size_prefix = [0u8; 2];
    stream.read_exact(&mut size_prefix).await?;
    let size = u16::from_be_bytes(size_prefix) as usize;
    let mut ciphertext = vec![0u8; size];
    stream.read_exact(&mut ciphertext).await?;

    let ack_plain = ecies_decrypt(static_key, &ciphertext, &size_prefix)?;
    let (remote_ephemeral, remote_nonce) = parse_ack(&ack_plain)?;

    let mut ack_message = size_prefix.to_vec();
    ack_message.extend(ciphertext);

    Ok(derive_secrets(
        &ephemeral_secret,
        &remote_ephemeral,
        &nonce,
        &remote_nonce,
        &auth_message,
        &ack_message,
        true,
    ))
}

// auth-body = [sig, initiator-pubk, initiator-nonce, auth-vsn], random
// padding appended, ECIES-sealed with the 2-byte size prefix as mac data.
fn auth_message(
    static_key: &SecretKey,
    ephemeral_secret: &SecretKey,
    nonce: &[u8; 32],
    remote_public: &PublicKey,
) -> Vec<u8> {
    let static_shared = ecdh_agree(remote_public, static_key);
    let mut digest = [0u8; 32];
    for (out, (a, b)) in digest.iter_mut().zip(static_shared.iter().zip(nonce)) {
        *out = a ^ b;
    }
    let (recovery_id, compact) = sign_recoverable(&digest, ephemeral_secret);
    let mut signature = [0u8; 65];
    signature[..64].copy_from_slice(&compact);
    signature[64] = recovery_id;

    let our_public = PublicKey::from_secret_key(SECP256K1, static_key);
    let mut payload = Vec::new();
    payload.extend(rlp::encode_bytes(&signature));
    payload.extend(rlp::encode_bytes(&our_public.serialize_uncompressed()[1..]));
    payload.extend(rlp::encode_bytes(nonce));
    payload.extend(rlp::encode_u64(AUTH_VSN));
    let mut body = rlp::encode_list(payload);

    let mut rng = rand::thread_rng();
    let padding: usize = rng.gen_range(100..=250);
    body.extend(std::iter::repeat_with(|| rng.gen::<u8>()).take(padding));

    seal(remote_public, &body)
}

// ECIES-seals a handshake body with its 2-byte size prefix as mac data.
fn seal(remote_public: &PublicKey, body: &[u8]) -> Vec<u8> {
    // ciphertext size = ECIES overhead (65 + 16 + 32) + body
    let size = (body.len() + 113) as u16;
    let size_prefix = size.to_be_bytes();
    let ciphertext = ecies_encrypt(remote_public, body, &size_prefix);

    let mut message = size_prefix.to_vec();
    message.extend(ciphertext);

    message
}

// ack-body = [recipient-ephemeral-pubk, recipient-nonce, ack-vsn, ...];
// additional list elements and trailing data are ignored per EIP-8.
fn parse_ack(plain: &[u8]) -> Result<(PublicKey, [u8; 32]), ProtocolError> {
    let (item, _consumed) = rlp::decode_item(plain)?;
    let fields = item.as_list()?;
    if fields.len() < 2 {
        return Err(ProtocolError::Rlp(rlp::RlpError::UnexpectedKind));
    }

    let ephemeral: [u8; 64] = fields[0].as_array()?;
    let mut encoded = [4u8; 65];
    encoded[1..].copy_from_slice(&ephemeral);
    let remote_ephemeral =
        PublicKey::from_slice(&encoded).map_err(|e| ProtocolError::Crypto(CryptoError::Secp(e)))?;
    let remote_nonce: [u8; 32] = fields[1].as_array()?;

    Ok((remote_ephemeral, remote_nonce))
}

/// Derives session secrets from the handshake transcript.
///
/// With `S = ecdh(ephemeral keys)`: `aes = keccak(S ‖ keccak(Nr ‖ Ni))`,
/// `mac = keccak(S ‖ aes)`, `token = keccak(S)`. The egress MAC starts from
/// `keccak(mac ⊕ remote-nonce ‖ sent-message)`, the ingress MAC from
/// `keccak(mac ⊕ own-nonce ‖ received-message)`.
#[allow(clippy::too_many_arguments)]
fn derive_secrets(
    ephemeral_secret: &SecretKey,
    remote_ephemeral: &PublicKey,
    initiator_nonce: &[u8; 32],
    recipient_nonce: &[u8; 32],
    auth_message: &[u8],
    ack_message: &[u8],
    initiator: bool,
) -> Secrets {
    let ephemeral_shared = ecdh_agree(remote_ephemeral, ephemeral_secret);
    let nonce_digest = keccak256_two(recipient_nonce, initiator_nonce);
    let aes_key = keccak256_two(&ephemeral_shared, &nonce_digest);
    let mac_key = keccak256_two(&ephemeral_shared, &aes_key);
    let token = crate::crypto::keccak256(&ephemeral_shared);

    let seed_mac = |nonce: &[u8; 32], transcript: &[u8]| {
        let mut xored = [0u8; 32];
        for (out, (key, nonce_byte)) in xored.iter_mut().zip(mac_key.iter().zip(nonce)) {
            *out = key ^ nonce_byte;
        }
        let mut mac = Keccak256::new();
        mac.update(xored);
        mac.update(transcript);
        mac
    };

    let (egress_mac, ingress_mac) = if initiator {
        (
            seed_mac(recipient_nonce, auth_message),
            seed_mac(initiator_nonce, ack_message),
        )
    } else {
        (
            seed_mac(initiator_nonce, ack_message),
            seed_mac(recipient_nonce, auth_message),
        )
    };

    Secrets {
        aes_key,
        mac_key,
        token,
        egress_mac,
        ingress_mac,
    }
}
