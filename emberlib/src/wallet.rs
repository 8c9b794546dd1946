//! `EthereumWallet`
//! The account key and the in-memory store behind the storage contract.

use std::collections::HashMap;

use ember_sync::keys::{AccountKey, KeyError};
use ember_sync::primitives::{Address, Hash32};
use ember_sync::wallet::traits::{
    SyncAccount, SyncBalances, SyncHeaders, SyncHeight, SyncTransactions, SyncWallet,
};
use ember_sync::wallet::{AccountState, Asset, BalanceRecord, HeaderStore, TransactionRecord};

use error::WalletError;

pub mod error;

/// One account's signing key and its locally durable chain projection.
///
/// The sync engine owns write access while it runs; reads flow through the
/// same maps. Persistence beyond process lifetime is the embedder's concern,
/// this store satisfies the key-value contract in memory.
#[derive(Debug)]
pub struct EthereumWallet {
    account_key: AccountKey,
    last_block_height: Option<u64>,
    balances: HashMap<Asset, BalanceRecord>,
    transactions: HashMap<Hash32, TransactionRecord>,
    headers: HeaderStore,
    account_state: Option<AccountState>,
}

impl EthereumWallet {
    /// Creates a wallet from an already-derived 32-byte secret key.
    ///
    /// Mnemonic and HD derivation happen upstream; the kit only ever sees
    /// the resulting scalar.
    pub fn new(secret: &[u8; 32]) -> Result<Self, KeyError> {
        Ok(Self {
            account_key: AccountKey::from_bytes(secret)?,
            last_block_height: None,
            balances: HashMap::new(),
            transactions: HashMap::new(),
            headers: HeaderStore::default(),
            account_state: None,
        })
    }

    /// The account's signing key.
    #[must_use]
    pub fn account_key(&self) -> &AccountKey {
        &self.account_key
    }

    /// The account address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.account_key.address()
    }

    /// The last proven or fetched account nonce.
    #[must_use]
    pub fn nonce(&self) -> Option<u64> {
        self.account_state.as_ref().map(|state| state.nonce)
    }

    /// Wipes every projection while keeping the key.
    pub fn clear_all(&mut self) {
        self.last_block_height = None;
        self.balances.clear();
        self.transactions.clear();
        self.headers.clear();
        self.account_state = None;
    }
}

impl SyncWallet for EthereumWallet {
    type Error = WalletError;

    fn clear(&mut self) -> Result<(), Self::Error> {
        self.clear_all();

        Ok(())
    }
}

impl SyncHeight for EthereumWallet {
    fn last_block_height(&self) -> Result<Option<u64>, Self::Error> {
        Ok(self.last_block_height)
    }

    fn set_last_block_height(&mut self, height: u64) -> Result<(), Self::Error> {
        self.last_block_height = Some(height);

        Ok(())
    }
}

impl SyncBalances for EthereumWallet {
    fn get_balances(&self) -> Result<&HashMap<Asset, BalanceRecord>, Self::Error> {
        Ok(&self.balances)
    }

    fn get_balances_mut(&mut self) -> Result<&mut HashMap<Asset, BalanceRecord>, Self::Error> {
        Ok(&mut self.balances)
    }
}

impl SyncTransactions for EthereumWallet {
    fn get_transactions(&self) -> Result<&HashMap<Hash32, TransactionRecord>, Self::Error> {
        Ok(&self.transactions)
    }

    fn get_transactions_mut(
        &mut self,
    ) -> Result<&mut HashMap<Hash32, TransactionRecord>, Self::Error> {
        Ok(&mut self.transactions)
    }
}

impl SyncHeaders for EthereumWallet {
    fn header_store(&self) -> Result<&HeaderStore, Self::Error> {
        Ok(&self.headers)
    }

    fn header_store_mut(&mut self) -> Result<&mut HeaderStore, Self::Error> {
        Ok(&mut self.headers)
    }
}

impl SyncAccount for EthereumWallet {
    fn account_state(&self) -> Result<Option<&AccountState>, Self::Error> {
        Ok(self.account_state.as_ref())
    }

    fn set_account_state(&mut self, state: AccountState) -> Result<(), Self::Error> {
        self.account_state = Some(state);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use ember_sync::primitives::{Address, Hash32};
    use ember_sync::transaction::Transaction;
    use ember_sync::wallet::traits::{SyncBalances, SyncTransactions};
    use ember_sync::wallet::{Asset, TransactionRecord};

    use super::EthereumWallet;

    fn test_wallet() -> EthereumWallet {
        EthereumWallet::new(&[0x46; 32]).unwrap()
    }

    fn record(hash_fill: u8, nonce: u64, block_height: Option<u64>) -> TransactionRecord {
        TransactionRecord {
            transaction: Transaction {
                hash: Hash32::new([hash_fill; 32]),
                nonce,
                from: Address::new([1; 20]),
                to: Address::new([2; 20]),
                value: BigUint::from(100u32),
                gas_price: 20_000_000_000,
                gas_limit: 21_000,
                input: Vec::new(),
                timestamp: 1_600_000_000,
                block_height,
            },
            asset: Asset::Native,
        }
    }

    #[test]
    fn balance_writes_are_monotonic_in_height() {
        let mut wallet = test_wallet();

        assert!(
            wallet
                .update_balance(Asset::Native, BigUint::from(10u32), 100)
                .unwrap()
        );
        // a stale poll result must not clobber the newer balance
        assert!(
            !wallet
                .update_balance(Asset::Native, BigUint::from(5u32), 90)
                .unwrap()
        );
        assert_eq!(
            wallet.balance(&Asset::Native).unwrap(),
            Some(BigUint::from(10u32))
        );
        // same value at a newer height is not a change
        assert!(
            !wallet
                .update_balance(Asset::Native, BigUint::from(10u32), 110)
                .unwrap()
        );
        assert!(
            wallet
                .update_balance(Asset::Native, BigUint::from(7u32), 120)
                .unwrap()
        );
    }

    #[test]
    fn transactions_query_is_newest_first() {
        let mut wallet = test_wallet();
        wallet
            .insert_transactions(vec![
                record(1, 0, Some(50)),
                record(2, 1, Some(60)),
                record(3, 2, Some(60)),
                record(4, 3, None),
            ])
            .unwrap();

        let all = wallet.transactions(None, None, None).unwrap();
        // pending first, then by (height, nonce) descending
        assert_eq!(all[0].hash, Hash32::new([4; 32]));
        assert_eq!(all[1].hash, Hash32::new([3; 32]));
        assert_eq!(all[2].hash, Hash32::new([2; 32]));
        assert_eq!(all[3].hash, Hash32::new([1; 32]));

        let from_second = wallet
            .transactions(Some(Hash32::new([3; 32])), Some(1), None)
            .unwrap();
        assert_eq!(from_second.len(), 1);
        assert_eq!(from_second[0].hash, Hash32::new([2; 32]));
    }

    #[test]
    fn confirming_a_pending_transaction_reports_it_changed() {
        let mut wallet = test_wallet();
        wallet.insert_transactions(vec![record(7, 4, None)]).unwrap();

        let changed = wallet
            .insert_transactions(vec![record(7, 4, Some(70))])
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].transaction.block_height, Some(70));

        // re-inserting the identical record is a no-op
        assert!(
            wallet
                .insert_transactions(vec![record(7, 4, Some(70))])
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn clear_is_total() {
        let mut wallet = test_wallet();
        wallet
            .update_balance(Asset::Native, BigUint::from(10u32), 100)
            .unwrap();
        wallet.insert_transactions(vec![record(1, 0, Some(50))]).unwrap();
        wallet.clear_all();

        assert!(wallet.balance(&Asset::Native).unwrap().is_none());
        assert!(wallet.transactions(None, None, None).unwrap().is_empty());
        assert!(wallet.nonce().is_none());
    }
}
