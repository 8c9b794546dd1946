//! Block headers, their canonical encoding and chain continuity checks.

use num_bigint::BigUint;

use crate::crypto::keccak256;
use crate::error::ContinuityError;
use crate::primitives::{Address, Hash32};
use crate::rlp::{self, Item, RlpError};

/// A verified block header. Written only after verification, never mutated.
///
/// `total_difficulty` is accumulated locally while verifying; it is not part
/// of the wire encoding and does not contribute to the hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Keccak of the RLP encoding (excluding total difficulty).
    pub hash: Hash32,
    /// Hash of the parent header.
    pub parent_hash: Hash32,
    /// Hash of the uncles list.
    pub uncles_hash: Hash32,
    /// Beneficiary address.
    pub coinbase: Address,
    /// Root of the state trie after this block.
    pub state_root: Hash32,
    /// Root of the transactions trie.
    pub transactions_root: Hash32,
    /// Root of the receipts trie.
    pub receipts_root: Hash32,
    /// Log bloom filter.
    pub logs_bloom: Vec<u8>,
    /// Block difficulty.
    pub difficulty: BigUint,
    /// Block number.
    pub number: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Gas used.
    pub gas_used: u64,
    /// Block timestamp.
    pub timestamp: u64,
    /// Arbitrary extra data, at most 32 bytes on mainnet.
    pub extra_data: Vec<u8>,
    /// Proof-of-work mix hash.
    pub mix_hash: Hash32,
    /// Proof-of-work nonce.
    pub nonce: [u8; 8],
    /// Cumulative difficulty up to and including this block.
    pub total_difficulty: BigUint,
}

impl BlockHeader {
    /// Canonical RLP encoding of the 15 consensus fields.
    #[must_use]
    pub fn encoded(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend(rlp::encode_bytes(self.parent_hash.as_bytes()));
        payload.extend(rlp::encode_bytes(self.uncles_hash.as_bytes()));
        payload.extend(rlp::encode_bytes(self.coinbase.as_bytes()));
        payload.extend(rlp::encode_bytes(self.state_root.as_bytes()));
        payload.extend(rlp::encode_bytes(self.transactions_root.as_bytes()));
        payload.extend(rlp::encode_bytes(self.receipts_root.as_bytes()));
        payload.extend(rlp::encode_bytes(&self.logs_bloom));
        payload.extend(rlp::encode_biguint(&self.difficulty));
        payload.extend(rlp::encode_u64(self.number));
        payload.extend(rlp::encode_u64(self.gas_limit));
        payload.extend(rlp::encode_u64(self.gas_used));
        payload.extend(rlp::encode_u64(self.timestamp));
        payload.extend(rlp::encode_bytes(&self.extra_data));
        payload.extend(rlp::encode_bytes(self.mix_hash.as_bytes()));
        payload.extend(rlp::encode_bytes(&self.nonce));

        rlp::encode_list(payload)
    }

    /// Recomputes the header hash from the canonical encoding.
    #[must_use]
    pub fn compute_hash(&self) -> Hash32 {
        Hash32::new(keccak256(&self.encoded()))
    }

    /// Decodes a header from an RLP item, deriving its hash.
    /// Total difficulty starts at zero until continuity verification fills it.
    pub fn from_rlp(item: &Item) -> Result<Self, RlpError> {
        let fields = item.as_list()?;
        if fields.len() != 15 {
            return Err(RlpError::UnexpectedKind);
        }

        let mut header = Self {
            hash: Hash32::default(),
            parent_hash: Hash32::new(fields[0].as_array()?),
            uncles_hash: Hash32::new(fields[1].as_array()?),
            coinbase: Address::new(fields[2].as_array()?),
            state_root: Hash32::new(fields[3].as_array()?),
            transactions_root: Hash32::new(fields[4].as_array()?),
            receipts_root: Hash32::new(fields[5].as_array()?),
            logs_bloom: fields[6].as_bytes()?.to_vec(),
            difficulty: fields[7].as_biguint()?,
            number: fields[8].as_u64()?,
            gas_limit: fields[9].as_u64()?,
            gas_used: fields[10].as_u64()?,
            timestamp: fields[11].as_u64()?,
            extra_data: fields[12].as_bytes()?.to_vec(),
            mix_hash: Hash32::new(fields[13].as_array()?),
            nonce: fields[14].as_array()?,
            total_difficulty: BigUint::default(),
        };
        header.hash = header.compute_hash();

        Ok(header)
    }
}

/// A compiled-in trusted block the SPV header chain grows from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: Hash32,
    /// Cumulative difficulty at the checkpoint.
    pub total_difficulty: BigUint,
}

/// Verifies that `headers` extend `(prev_number, prev_hash)` without gaps and
/// fills in each header's cumulative difficulty from `prev_total_difficulty`.
///
/// The batch is rejected whole on the first discontinuity, leaving the caller
/// free to discard it without partial effects.
pub fn verify_continuity(
    prev_number: u64,
    prev_hash: Hash32,
    prev_total_difficulty: &BigUint,
    headers: &mut [BlockHeader],
) -> Result<(), ContinuityError> {
    let mut expected_parent = prev_hash;
    let mut expected_number = prev_number;
    let mut total_difficulty = prev_total_difficulty.clone();

    for header in headers.iter_mut() {
        expected_number += 1;
        if header.number != expected_number {
            return Err(ContinuityError::HeightDiscontinuity {
                height: header.number,
                expected_height: expected_number,
            });
        }
        if header.parent_hash != expected_parent {
            return Err(ContinuityError::HashDiscontinuity {
                height: header.number,
                parent_hash: header.parent_hash,
                previous_hash: expected_parent,
            });
        }
        total_difficulty += &header.difficulty;
        header.total_difficulty = total_difficulty.clone();
        expected_parent = header.hash;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use num_bigint::BigUint;

    use crate::error::ContinuityError;
    use crate::primitives::{Address, Hash32};
    use crate::rlp;

    use super::{BlockHeader, verify_continuity};

    /// Builds a minimal synthetic header on top of `parent`.
    pub(crate) fn child_header(parent_hash: Hash32, number: u64) -> BlockHeader {
        let mut header = BlockHeader {
            hash: Hash32::default(),
            parent_hash,
            uncles_hash: Hash32::new([1; 32]),
            coinbase: Address::new([2; 20]),
            state_root: Hash32::new([3; 32]),
            transactions_root: Hash32::new([4; 32]),
            receipts_root: Hash32::new([5; 32]),
            logs_bloom: vec![0; 256],
            difficulty: BigUint::from(1000u32),
            number,
            gas_limit: 8_000_000,
            gas_used: 21_000,
            timestamp: 1_540_000_000 + number,
            extra_data: Vec::new(),
            mix_hash: Hash32::new([6; 32]),
            nonce: [7; 8],
            total_difficulty: BigUint::default(),
        };
        header.hash = header.compute_hash();

        header
    }

    pub(crate) fn synthetic_chain(origin_hash: Hash32, origin_number: u64, len: u64) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut parent_hash = origin_hash;
        for offset in 1..=len {
            let header = child_header(parent_hash, origin_number + offset);
            parent_hash = header.hash;
            headers.push(header);
        }

        headers
    }

    #[test]
    fn encoding_round_trip_preserves_hash() {
        let header = child_header(Hash32::new([9; 32]), 42);
        let decoded = BlockHeader::from_rlp(&rlp::decode(&header.encoded()).unwrap()).unwrap();
        assert_eq!(decoded.hash, header.hash);
        assert_eq!(decoded.parent_hash, header.parent_hash);
        assert_eq!(decoded.number, header.number);
    }

    #[test]
    fn accepts_continuous_chain_and_accumulates_difficulty() {
        let origin = Hash32::new([0; 32]);
        let mut headers = synthetic_chain(origin, 100, 5);

        verify_continuity(100, origin, &BigUint::from(5000u32), &mut headers).unwrap();
        assert_eq!(headers[0].total_difficulty, BigUint::from(6000u32));
        assert_eq!(headers[4].total_difficulty, BigUint::from(10_000u32));
    }

    #[test]
    fn rejects_hash_discontinuity() {
        let origin = Hash32::new([0; 32]);
        let mut headers = synthetic_chain(origin, 100, 5);
        headers[3].parent_hash = Hash32::new([0xaa; 32]);

        let error =
            verify_continuity(100, origin, &BigUint::default(), &mut headers).unwrap_err();
        assert!(matches!(
            error,
            ContinuityError::HashDiscontinuity { height: 104, .. }
        ));
    }

    #[test]
    fn rejects_height_gap() {
        let origin = Hash32::new([0; 32]);
        let mut headers = synthetic_chain(origin, 100, 3);
        headers[2].number = 200;

        let error =
            verify_continuity(100, origin, &BigUint::default(), &mut headers).unwrap_err();
        assert!(matches!(
            error,
            ContinuityError::HeightDiscontinuity { height: 200, .. }
        ));
    }
}
