//! Merkle-Patricia account-proof verification.
//!
//! An account proof is the list of trie nodes on the path from the state root
//! to `keccak(address)`. The walk recomputes each node hash, so a proof that
//! reaches a terminal value is authenticated by the state root alone.

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::crypto::keccak256;
use crate::primitives::{Address, Hash32};
use crate::rlp::{self, Item};
use crate::wallet::AccountState;

/// Errors verifying an account proof against a state root.
#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    /// A referenced node is not present in the proof.
    #[error("proof is missing node {0}")]
    MissingNode(Hash32),
    /// A node is not valid RLP or has an impossible shape.
    #[error("malformed proof node. {0}")]
    Malformed(#[from] rlp::RlpError),
    /// A node is neither a branch nor a two-item node.
    #[error("proof node has {0} items")]
    UnexpectedNodeShape(usize),
    /// A hex-prefix encoded path is invalid.
    #[error("invalid hex-prefix encoding")]
    InvalidHexPrefix,
    /// The terminal value does not decode as an account.
    #[error("terminal value is not an account")]
    InvalidAccount,
}

/// Verifies `proof` against `state_root`, returning the account state for
/// `address`.
///
/// A well-formed exclusion proof (the path ends in an empty slot or diverges
/// at a leaf) yields the empty account: the chain has never seen the address.
pub fn verify_account_proof(
    state_root: &Hash32,
    address: &Address,
    proof: &[Vec<u8>],
) -> Result<AccountState, ProofError> {
    let nodes: HashMap<[u8; 32], &[u8]> = proof
        .iter()
        .map(|node| (keccak256(node), node.as_slice()))
        .collect();

    let path = bytes_to_nibbles(&keccak256(address.as_bytes()));
    let mut remaining: &[u8] = &path;
    let mut current = lookup(&nodes, state_root.as_bytes())?;

    loop {
        let items = current.as_list()?;
        match items.len() {
            17 => {
                let Some((nibble, rest)) = remaining.split_first() else {
                    // our 64-nibble paths never terminate inside a branch
                    return decode_account(&items[16]);
                };
                remaining = rest;
                match &items[*nibble as usize] {
                    Item::Bytes(bytes) if bytes.is_empty() => {
                        return Ok(AccountState::empty());
                    }
                    Item::Bytes(bytes) if bytes.len() == 32 => {
                        let mut hash = [0u8; 32];
                        hash.copy_from_slice(bytes);
                        current = lookup(&nodes, &hash)?;
                    }
                    // nodes under 32 bytes are embedded in the parent
                    embedded => current = embedded.clone(),
                }
            }
            2 => {
                let (partial, is_leaf) = hp_decode(items[0].as_bytes()?)?;
                if is_leaf {
                    return if remaining == partial.as_slice() {
                        decode_account(&items[1])
                    } else {
                        Ok(AccountState::empty())
                    };
                }
                let Some(rest) = remaining.strip_prefix(partial.as_slice()) else {
                    return Ok(AccountState::empty());
                };
                remaining = rest;
                match &items[1] {
                    Item::Bytes(bytes) if bytes.len() == 32 => {
                        let mut hash = [0u8; 32];
                        hash.copy_from_slice(bytes);
                        current = lookup(&nodes, &hash)?;
                    }
                    embedded => current = embedded.clone(),
                }
            }
            len => return Err(ProofError::UnexpectedNodeShape(len)),
        }
    }
}

fn lookup(nodes: &HashMap<[u8; 32], &[u8]>, hash: &[u8; 32]) -> Result<Item, ProofError> {
    let node = nodes
        .get(hash)
        .ok_or(ProofError::MissingNode(Hash32::new(*hash)))?;

    Ok(rlp::decode(node)?)
}

fn decode_account(value: &Item) -> Result<AccountState, ProofError> {
    let encoded = value.as_bytes().map_err(|_| ProofError::InvalidAccount)?;
    let item = rlp::decode(encoded).map_err(|_| ProofError::InvalidAccount)?;
    let fields = item.as_list().map_err(|_| ProofError::InvalidAccount)?;
    if fields.len() != 4 {
        return Err(ProofError::InvalidAccount);
    }

    Ok(AccountState {
        nonce: fields[0].as_u64().map_err(|_| ProofError::InvalidAccount)?,
        balance: BigUint::from_bytes_be(
            fields[1].as_bytes().map_err(|_| ProofError::InvalidAccount)?,
        ),
        storage_root: Hash32::new(
            fields[2].as_array().map_err(|_| ProofError::InvalidAccount)?,
        ),
        code_hash: Hash32::new(
            fields[3].as_array().map_err(|_| ProofError::InvalidAccount)?,
        ),
    })
}

/// Expands bytes into their nibble sequence, high nibble first.
#[must_use]
pub fn bytes_to_nibbles(bytes: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }

    nibbles
}

/// Decodes a hex-prefix encoded path into `(nibbles, is_leaf)`.
pub fn hp_decode(encoded: &[u8]) -> Result<(Vec<u8>, bool), ProofError> {
    let first = *encoded.first().ok_or(ProofError::InvalidHexPrefix)?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(ProofError::InvalidHexPrefix);
    }
    let is_leaf = flag >= 2;
    let is_odd = flag % 2 == 1;

    let mut nibbles = Vec::new();
    if is_odd {
        nibbles.push(first & 0x0f);
    } else if first & 0x0f != 0 {
        return Err(ProofError::InvalidHexPrefix);
    }
    nibbles.extend(bytes_to_nibbles(&encoded[1..]));

    Ok((nibbles, is_leaf))
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use crate::crypto::keccak256;
    use crate::primitives::{Address, Hash32};
    use crate::rlp;
    use crate::wallet::AccountState;

    use super::{ProofError, bytes_to_nibbles, hp_decode, verify_account_proof};

    fn hp_encode(nibbles: &[u8], is_leaf: bool) -> Vec<u8> {
        let mut flag = if is_leaf { 2u8 } else { 0 };
        let mut out = Vec::new();
        if nibbles.len() % 2 == 1 {
            flag += 1;
            out.push((flag << 4) | nibbles[0]);
            for pair in nibbles[1..].chunks(2) {
                out.push((pair[0] << 4) | pair[1]);
            }
        } else {
            out.push(flag << 4);
            for pair in nibbles.chunks(2) {
                out.push((pair[0] << 4) | pair[1]);
            }
        }

        out
    }

    fn encode_account(state: &AccountState) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend(rlp::encode_u64(state.nonce));
        payload.extend(rlp::encode_biguint(&state.balance));
        payload.extend(rlp::encode_bytes(state.storage_root.as_bytes()));
        payload.extend(rlp::encode_bytes(state.code_hash.as_bytes()));

        rlp::encode_list(payload)
    }

    fn test_account() -> AccountState {
        AccountState {
            nonce: 3,
            balance: BigUint::from(1_000_000_000_000_000_000u64),
            storage_root: Hash32::new(AccountState::EMPTY_STORAGE_ROOT),
            code_hash: Hash32::new(AccountState::EMPTY_CODE_HASH),
        }
    }

    fn leaf_node(path_nibbles: &[u8], account: &AccountState) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend(rlp::encode_bytes(&hp_encode(path_nibbles, true)));
        payload.extend(rlp::encode_bytes(&encode_account(account)));

        rlp::encode_list(payload)
    }

    #[test]
    fn hex_prefix_round_trip() {
        for (nibbles, is_leaf) in [
            (vec![1u8, 2, 3], true),
            (vec![1, 2, 3, 4], false),
            (vec![], false),
            (vec![0xf], true),
        ] {
            let encoded = hp_encode(&nibbles, is_leaf);
            assert_eq!(hp_decode(&encoded).unwrap(), (nibbles, is_leaf));
        }
    }

    #[test]
    fn single_leaf_proof_verifies() {
        let address = Address::new([0x11; 20]);
        let account = test_account();
        let path = bytes_to_nibbles(&keccak256(address.as_bytes()));

        let node = leaf_node(&path, &account);
        let root = Hash32::new(keccak256(&node));

        let proven = verify_account_proof(&root, &address, &[node]).unwrap();
        assert_eq!(proven, account);
    }

    #[test]
    fn branch_proof_selects_our_leaf() {
        let address = Address::new([0x22; 20]);
        let account = test_account();
        let path = bytes_to_nibbles(&keccak256(address.as_bytes()));

        // our leaf hangs off the branch slot for the first nibble; a sibling
        // occupies a different slot
        let our_leaf = leaf_node(&path[1..], &account);
        let sibling_nibble = (path[0] + 1) % 16;
        let sibling_leaf = leaf_node(&path[1..], &AccountState::empty());

        let mut payload = Vec::new();
        for slot in 0..16u8 {
            if slot == path[0] {
                payload.extend(rlp::encode_bytes(&keccak256(&our_leaf)));
            } else if slot == sibling_nibble {
                payload.extend(rlp::encode_bytes(&keccak256(&sibling_leaf)));
            } else {
                payload.extend(rlp::encode_bytes(&[]));
            }
        }
        payload.extend(rlp::encode_bytes(&[]));
        let branch = rlp::encode_list(payload);
        let root = Hash32::new(keccak256(&branch));

        let proven =
            verify_account_proof(&root, &address, &[branch, our_leaf, sibling_leaf]).unwrap();
        assert_eq!(proven, account);
    }

    #[test]
    fn missing_node_is_rejected() {
        let address = Address::new([0x33; 20]);
        let account = test_account();
        let path = bytes_to_nibbles(&keccak256(address.as_bytes()));

        let mut node = leaf_node(&path, &account);
        let root = Hash32::new(keccak256(&node));
        // tamper after hashing: the lookup by root hash must fail
        let last = node.len() - 1;
        node[last] ^= 0x01;

        assert!(matches!(
            verify_account_proof(&root, &address, &[node]),
            Err(ProofError::MissingNode(_))
        ));
    }

    #[test]
    fn exclusion_yields_empty_account() {
        let ours = Address::new([0x44; 20]);
        let other = Address::new([0x55; 20]);
        let account = test_account();

        // a single-leaf trie for a different address excludes ours
        let other_path = bytes_to_nibbles(&keccak256(other.as_bytes()));
        let node = leaf_node(&other_path, &account);
        let root = Hash32::new(keccak256(&node));

        let proven = verify_account_proof(&root, &ours, &[node]).unwrap();
        assert_eq!(proven, AccountState::empty());
    }
}
