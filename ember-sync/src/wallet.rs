//! Types stored by and exchanged with the wallet store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8};

use num_bigint::BigUint;

use crate::error::SyncModeError;
use crate::header::BlockHeader;
use crate::primitives::{Address, Hash32};

pub mod traits;

/// An asset tracked for the account: the native coin or an ERC-20 contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Asset {
    /// The chain's native coin.
    Native,
    /// An ERC-20 token identified by its contract address.
    Erc20(Address),
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Erc20(contract) => write!(f, "erc20:{contract}"),
        }
    }
}

/// Account state proven or fetched at a specific block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    /// Account nonce.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: BigUint,
    /// Root of the account's storage trie.
    pub storage_root: Hash32,
    /// Keccak of the account's code.
    pub code_hash: Hash32,
}

impl AccountState {
    /// Root hash of an empty trie, `keccak(rlp(""))`.
    pub const EMPTY_STORAGE_ROOT: [u8; 32] = [
        0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0,
        0xf8, 0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5,
        0xe3, 0x63, 0xb4, 0x21,
    ];
    /// Keccak of empty code, `keccak("")`.
    pub const EMPTY_CODE_HASH: [u8; 32] = [
        0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7,
        0x03, 0xc0, 0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04,
        0x5d, 0x85, 0xa4, 0x70,
    ];

    /// The state of an account the chain has never seen.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: BigUint::default(),
            storage_root: Hash32::new(Self::EMPTY_STORAGE_ROOT),
            code_hash: Hash32::new(Self::EMPTY_CODE_HASH),
        }
    }
}

/// A balance together with the height it was learned at.
///
/// The height watermark keeps stale poll results from overwriting newer data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRecord {
    /// Balance in wei.
    pub amount: BigUint,
    /// Chain height the balance was observed at.
    pub block_height: u64,
}

/// A stored transaction attributed to the asset whose index produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// The transaction projection.
    pub transaction: crate::transaction::Transaction,
    /// The asset this record belongs to.
    pub asset: Asset,
}

/// Header chain storage: headers by hash with a by-number index.
///
/// Batches insert atomically from the store's point of view; a rejected batch
/// never leaves partial headers behind.
#[derive(Debug, Default, Clone)]
pub struct HeaderStore {
    by_hash: HashMap<Hash32, BlockHeader>,
    by_number: BTreeMap<u64, Hash32>,
}

impl HeaderStore {
    /// Inserts a verified batch.
    pub fn insert_batch(&mut self, headers: Vec<BlockHeader>) {
        for header in headers {
            self.by_number.insert(header.number, header.hash);
            self.by_hash.insert(header.hash, header);
        }
    }

    /// Looks a header up by hash.
    #[must_use]
    pub fn get(&self, hash: &Hash32) -> Option<&BlockHeader> {
        self.by_hash.get(hash)
    }

    /// Looks a header up through the number index.
    #[must_use]
    pub fn at_number(&self, number: u64) -> Option<&BlockHeader> {
        self.by_number.get(&number).and_then(|hash| self.by_hash.get(hash))
    }

    /// The highest stored header.
    #[must_use]
    pub fn head(&self) -> Option<&BlockHeader> {
        self.by_number
            .last_key_value()
            .and_then(|(_, hash)| self.by_hash.get(hash))
    }

    /// Number of stored headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the store holds no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Drops every stored header.
    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.by_number.clear();
    }
}

/// The lifecycle of a sync process, shared atomically with its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMode {
    /// No sync process is running.
    NotRunning = 0,
    /// Sync is running.
    Running = 1,
    /// Sync has been asked to shut down and is winding down.
    Shutdown = 2,
}

impl SyncMode {
    /// Reads the enum form out of its atomic representation.
    pub fn from_atomic_u8(sync_mode: Arc<AtomicU8>) -> Result<Self, SyncModeError> {
        match sync_mode.load(atomic::Ordering::Acquire) {
            0 => Ok(Self::NotRunning),
            1 => Ok(Self::Running),
            2 => Ok(Self::Shutdown),
            mode => Err(SyncModeError::InvalidSyncMode(mode)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::header::tests::synthetic_chain;
    use crate::primitives::Hash32;

    use super::HeaderStore;

    #[test]
    fn header_store_indexes_by_number_and_hash() {
        let mut store = HeaderStore::default();
        let headers = synthetic_chain(Hash32::new([0; 32]), 10, 4);
        let head_hash = headers[3].hash;

        store.insert_batch(headers);
        assert_eq!(store.len(), 4);
        assert_eq!(store.head().unwrap().hash, head_hash);
        assert_eq!(store.at_number(12).unwrap().number, 12);
        assert!(store.get(&head_hash).is_some());
        assert!(store.at_number(9).is_none());
    }
}
