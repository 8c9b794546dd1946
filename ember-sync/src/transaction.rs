//! Transaction building and EIP-155 signing.

use num_bigint::BigUint;

use crate::crypto::{keccak256, sign_recoverable};
use crate::keys::AccountKey;
use crate::primitives::{Address, Hash32};
use crate::rlp;

/// A transaction under construction. The nonce is absent until the back-end
/// assigns one immediately before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    /// Account nonce, assigned by the back-end.
    pub nonce: Option<u64>,
    /// Gas price in wei.
    pub gas_price: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Recipient account or contract.
    pub to: Address,
    /// Transferred value in wei.
    pub value: BigUint,
    /// Call data; empty for plain value transfers.
    pub data: Vec<u8>,
}

impl RawTransaction {
    /// Builds a value transfer with empty call data.
    #[must_use]
    pub fn new(gas_price: u64, gas_limit: u64, to: Address, value: BigUint) -> Self {
        Self {
            nonce: None,
            gas_price,
            gas_limit,
            to,
            value,
            data: Vec::new(),
        }
    }

    /// Attaches call data for a contract call.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// An ECDSA signature with its EIP-155 recovery byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// `recovery_id + 35 + 2 · chain_id`.
    pub v: u8,
    /// First signature half.
    pub r: [u8; 32],
    /// Second signature half, low-S canonical.
    pub s: [u8; 32],
}

/// A transaction record as projected into the wallet store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Keccak of the fully signed RLP payload.
    pub hash: Hash32,
    /// Sender nonce.
    pub nonce: u64,
    /// Sender address.
    pub from: Address,
    /// Recipient address.
    pub to: Address,
    /// Transferred value in wei.
    pub value: BigUint,
    /// Gas price in wei.
    pub gas_price: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Call data.
    pub input: Vec<u8>,
    /// Unix timestamp the record was observed or created.
    pub timestamp: i64,
    /// Containing block, `None` while pending.
    pub block_height: Option<u64>,
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// The wallet-store projection of the signed transfer.
    pub transaction: Transaction,
    /// The canonical signed RLP payload for `eth_sendRawTransaction`/`SendTx`.
    pub encoded: Vec<u8>,
    /// The applied signature.
    pub signature: Signature,
}

fn encode_base_fields(payload: &mut Vec<u8>, raw: &RawTransaction, nonce: u64) {
    payload.extend(rlp::encode_u64(nonce));
    payload.extend(rlp::encode_u64(raw.gas_price));
    payload.extend(rlp::encode_u64(raw.gas_limit));
    payload.extend(rlp::encode_bytes(raw.to.as_bytes()));
    payload.extend(rlp::encode_biguint(&raw.value));
    payload.extend(rlp::encode_bytes(&raw.data));
}

/// The EIP-155 signing digest:
/// `keccak(RLP(nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0))`.
#[must_use]
pub fn signing_hash(raw: &RawTransaction, nonce: u64, chain_id: u64) -> [u8; 32] {
    let mut payload = Vec::new();
    encode_base_fields(&mut payload, raw, nonce);
    payload.extend(rlp::encode_u64(chain_id));
    payload.extend(rlp::encode_u64(0));
    payload.extend(rlp::encode_u64(0));

    keccak256(&rlp::encode_list(payload))
}

/// Signs `raw` with the assigned `nonce`, mixing `chain_id` into `v`.
///
/// The transaction hash is keccak over the final signed RLP.
#[must_use]
pub fn sign(
    raw: &RawTransaction,
    nonce: u64,
    chain_id: u64,
    key: &AccountKey,
) -> SignedTransaction {
    let digest = signing_hash(raw, nonce, chain_id);
    let (recovery_id, compact) = sign_recoverable(&digest, key.secret());

    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&compact[..32]);
    s.copy_from_slice(&compact[32..]);
    let signature = Signature {
        v: recovery_id + 35 + (2 * chain_id) as u8,
        r,
        s,
    };

    let mut payload = Vec::new();
    encode_base_fields(&mut payload, raw, nonce);
    payload.extend(rlp::encode_u64(u64::from(signature.v)));
    payload.extend(rlp::encode_biguint(&BigUint::from_bytes_be(&signature.r)));
    payload.extend(rlp::encode_biguint(&BigUint::from_bytes_be(&signature.s)));
    let encoded = rlp::encode_list(payload);

    let transaction = Transaction {
        hash: Hash32::new(keccak256(&encoded)),
        nonce,
        from: key.address(),
        to: raw.to,
        value: raw.value.clone(),
        gas_price: raw.gas_price,
        gas_limit: raw.gas_limit,
        input: raw.data.clone(),
        timestamp: unix_time(),
        block_height: None,
    };

    SignedTransaction {
        transaction,
        encoded,
        signature,
    }
}

fn unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
