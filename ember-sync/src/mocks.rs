//! In-memory wallet store used by engine tests.

use std::collections::HashMap;
use std::convert::Infallible;

use crate::primitives::Hash32;
use crate::wallet::traits::{
    SyncAccount, SyncBalances, SyncHeaders, SyncHeight, SyncTransactions, SyncWallet,
};
use crate::wallet::{AccountState, Asset, BalanceRecord, HeaderStore, TransactionRecord};

/// A bare-map wallet store for exercising the sync engine.
#[derive(Debug, Default)]
pub(crate) struct TestWallet {
    pub(crate) last_block_height: Option<u64>,
    pub(crate) balances: HashMap<Asset, BalanceRecord>,
    pub(crate) transactions: HashMap<Hash32, TransactionRecord>,
    pub(crate) headers: HeaderStore,
    pub(crate) account_state: Option<AccountState>,
}

impl SyncWallet for TestWallet {
    type Error = Infallible;

    fn clear(&mut self) -> Result<(), Self::Error> {
        *self = Self::default();

        Ok(())
    }
}

impl SyncHeight for TestWallet {
    fn last_block_height(&self) -> Result<Option<u64>, Self::Error> {
        Ok(self.last_block_height)
    }

    fn set_last_block_height(&mut self, height: u64) -> Result<(), Self::Error> {
        self.last_block_height = Some(height);

        Ok(())
    }
}

impl SyncBalances for TestWallet {
    fn get_balances(&self) -> Result<&HashMap<Asset, BalanceRecord>, Self::Error> {
        Ok(&self.balances)
    }

    fn get_balances_mut(&mut self) -> Result<&mut HashMap<Asset, BalanceRecord>, Self::Error> {
        Ok(&mut self.balances)
    }
}

impl SyncTransactions for TestWallet {
    fn get_transactions(&self) -> Result<&HashMap<Hash32, TransactionRecord>, Self::Error> {
        Ok(&self.transactions)
    }

    fn get_transactions_mut(
        &mut self,
    ) -> Result<&mut HashMap<Hash32, TransactionRecord>, Self::Error> {
        Ok(&mut self.transactions)
    }
}

impl SyncHeaders for TestWallet {
    fn header_store(&self) -> Result<&HeaderStore, Self::Error> {
        Ok(&self.headers)
    }

    fn header_store_mut(&mut self) -> Result<&mut HeaderStore, Self::Error> {
        Ok(&mut self.headers)
    }
}

impl SyncAccount for TestWallet {
    fn account_state(&self) -> Result<Option<&AccountState>, Self::Error> {
        Ok(self.account_state.as_ref())
    }

    fn set_account_state(&mut self, state: AccountState) -> Result<(), Self::Error> {
        self.account_state = Some(state);

        Ok(())
    }
}
