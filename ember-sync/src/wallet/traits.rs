//! Traits for interfacing a wallet store with the sync engine.
//!
//! The engine owns write access while it runs; the consumer's API surface
//! reads through the same store. Reads are consistent with writes that
//! preceded them on the same task.

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::primitives::Hash32;
use crate::transaction::Transaction;
use crate::wallet::{AccountState, Asset, BalanceRecord, HeaderStore, TransactionRecord};

/// Trait for interfacing a wallet store with the sync engine.
pub trait SyncWallet {
    /// Errors associated with interfacing the sync engine with wallet data.
    type Error: std::fmt::Debug + std::fmt::Display + std::error::Error;

    /// Wipes all synced data. Must be total: height, balances, transactions,
    /// headers and account state.
    fn clear(&mut self) -> Result<(), Self::Error>;
}

/// Trait for interfacing the persisted chain height with wallet data.
pub trait SyncHeight: SyncWallet {
    /// Returns the last persisted chain height, if any.
    fn last_block_height(&self) -> Result<Option<u64>, Self::Error>;

    /// Persists the last observed chain height.
    fn set_last_block_height(&mut self, height: u64) -> Result<(), Self::Error>;
}

/// Trait for interfacing per-asset balances with wallet data.
pub trait SyncBalances: SyncWallet {
    /// Get reference to the balance map.
    fn get_balances(&self) -> Result<&HashMap<Asset, BalanceRecord>, Self::Error>;

    /// Get mutable reference to the balance map.
    fn get_balances_mut(&mut self) -> Result<&mut HashMap<Asset, BalanceRecord>, Self::Error>;

    /// Returns the stored balance for `asset`.
    fn balance(&self, asset: &Asset) -> Result<Option<BigUint>, Self::Error> {
        Ok(self.get_balances()?.get(asset).map(|record| record.amount.clone()))
    }

    /// Records a balance learned at `block_height`.
    ///
    /// A balance attributed to height `h` is never overwritten by a value
    /// learned for a lower height. Returns whether the stored value changed.
    fn update_balance(
        &mut self,
        asset: Asset,
        amount: BigUint,
        block_height: u64,
    ) -> Result<bool, Self::Error> {
        let balances = self.get_balances_mut()?;
        match balances.get(&asset) {
            Some(record) if record.block_height > block_height => Ok(false),
            Some(record) if record.amount == amount => {
                let block_height = record.block_height.max(block_height);
                balances.insert(asset, BalanceRecord { amount, block_height });
                Ok(false)
            }
            _ => {
                balances.insert(asset, BalanceRecord { amount, block_height });
                Ok(true)
            }
        }
    }
}

/// Trait for interfacing the transaction log with wallet data.
pub trait SyncTransactions: SyncWallet {
    /// Get reference to the transaction log.
    fn get_transactions(&self) -> Result<&HashMap<Hash32, TransactionRecord>, Self::Error>;

    /// Get mutable reference to the transaction log.
    fn get_transactions_mut(
        &mut self,
    ) -> Result<&mut HashMap<Hash32, TransactionRecord>, Self::Error>;

    /// Inserts transaction records, returning the ones that were new or
    /// gained a block height (pending record confirmed by the index).
    fn insert_transactions(
        &mut self,
        records: Vec<TransactionRecord>,
    ) -> Result<Vec<TransactionRecord>, Self::Error> {
        let log = self.get_transactions_mut()?;
        let mut changed = Vec::new();
        for record in records {
            let hash = record.transaction.hash;
            match log.get(&hash) {
                Some(stored)
                    if stored.transaction.block_height == record.transaction.block_height =>
                {
                    continue;
                }
                _ => {
                    log.insert(hash, record.clone());
                    changed.push(record);
                }
            }
        }

        Ok(changed)
    }

    /// Queries the log newest-first, ordered by `(block_height, nonce)`
    /// descending with pending transactions first.
    ///
    /// `from_hash` restricts the result to records strictly older than the
    /// referenced one; `asset` restricts to one asset's records.
    fn transactions(
        &self,
        from_hash: Option<Hash32>,
        limit: Option<usize>,
        asset: Option<&Asset>,
    ) -> Result<Vec<Transaction>, Self::Error> {
        let log = self.get_transactions()?;
        let mut records: Vec<&TransactionRecord> = log
            .values()
            .filter(|record| asset.is_none_or(|asset| record.asset == *asset))
            .collect();
        records.sort_by(|a, b| {
            let height_a = a.transaction.block_height.unwrap_or(u64::MAX);
            let height_b = b.transaction.block_height.unwrap_or(u64::MAX);
            height_b
                .cmp(&height_a)
                .then(b.transaction.nonce.cmp(&a.transaction.nonce))
        });

        let skip = match from_hash {
            Some(hash) => match records
                .iter()
                .position(|record| record.transaction.hash == hash)
            {
                Some(position) => position + 1,
                None => 0,
            },
            None => 0,
        };

        Ok(records
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .map(|record| record.transaction.clone())
            .collect())
    }

    /// Looks a single transaction up by hash.
    fn transaction(&self, hash: &Hash32) -> Result<Option<Transaction>, Self::Error> {
        Ok(self
            .get_transactions()?
            .get(hash)
            .map(|record| record.transaction.clone()))
    }
}

/// Trait for interfacing the SPV header chain with wallet data.
pub trait SyncHeaders: SyncWallet {
    /// Get reference to the header store.
    fn header_store(&self) -> Result<&HeaderStore, Self::Error>;

    /// Get mutable reference to the header store.
    fn header_store_mut(&mut self) -> Result<&mut HeaderStore, Self::Error>;
}

/// Trait for interfacing the proven account state with wallet data.
pub trait SyncAccount: SyncWallet {
    /// Returns the last proven account state.
    fn account_state(&self) -> Result<Option<&AccountState>, Self::Error>;

    /// Replaces the proven account state.
    fn set_account_state(&mut self, state: AccountState) -> Result<(), Self::Error>;
}
