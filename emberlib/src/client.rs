//! Struct which owns and manages the [`crate::wallet::EthereumWallet`].
//! Responsible for running a sync back-end, fanning its events out to
//! subscribers and serving reads, sends and contract calls.
//!
//! `sync_mode` is an atomic representation of
//! [`ember_sync::wallet::SyncMode`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::AtomicU8;

use num_bigint::BigUint;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use ember_status::sync_status::SyncStatus;
use ember_sync::client::{CallRequest, LogEntry, LogFilter};
use ember_sync::error::{RequestError, SyncError, SyncModeError};
use ember_sync::primitives::{Address, AddressError, Hash32};
use ember_sync::sync::{BackendRequest, SyncEvent};
use ember_sync::transaction::Transaction;
use ember_sync::wallet::traits::{SyncBalances, SyncTransactions};
use ember_sync::wallet::Asset;

use crate::config::EmberConfig;
use crate::wallet::error::WalletError;
use crate::wallet::EthereumWallet;
use error::ClientError;

pub mod error;
pub mod send;
pub mod sync;

// The in-memory store's error type is uninhabited.
pub(crate) fn infallible<T>(result: Result<T, WalletError>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => match error {},
    }
}

/// The per-event-kind subscription streams owned by the client.
///
/// Height, status and balances carry latest-value semantics with
/// value-equality dedup; transaction batches are delivered to every
/// subscriber and never dropped.
pub(crate) struct Streams {
    last_block_height: watch::Sender<Option<u64>>,
    sync_status: watch::Sender<SyncStatus>,
    native_balance: watch::Sender<Option<BigUint>>,
    token_balances: std::sync::RwLock<HashMap<Address, watch::Sender<Option<BigUint>>>>,
    token_status: std::sync::RwLock<HashMap<Address, watch::Sender<SyncStatus>>>,
    transaction_subscribers:
        std::sync::Mutex<Vec<mpsc::UnboundedSender<(Asset, Vec<Transaction>)>>>,
}

impl Streams {
    fn new() -> Self {
        Self {
            last_block_height: watch::channel(None).0,
            sync_status: watch::channel(SyncStatus::NotSynced(None)).0,
            native_balance: watch::channel(None).0,
            token_balances: std::sync::RwLock::new(HashMap::new()),
            token_status: std::sync::RwLock::new(HashMap::new()),
            transaction_subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn set_if_changed<T: PartialEq>(sender: &watch::Sender<T>, value: T) {
        sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    // Events arrive on one channel in back-end observation order, so a
    // subscriber never sees a balance before the height it derives from.
    pub(crate) fn dispatch(&self, event: SyncEvent) {
        match event {
            SyncEvent::LastBlockHeight(height) => {
                Self::set_if_changed(&self.last_block_height, Some(height));
            }
            SyncEvent::Status(Asset::Native, status) => {
                Self::set_if_changed(&self.sync_status, status);
            }
            SyncEvent::Status(Asset::Erc20(contract), status) => {
                let senders = self.token_status.read().expect("status lock poisoned");
                if let Some(sender) = senders.get(&contract) {
                    Self::set_if_changed(sender, status);
                }
            }
            SyncEvent::Balance(Asset::Native, amount) => {
                Self::set_if_changed(&self.native_balance, Some(amount));
            }
            SyncEvent::Balance(Asset::Erc20(contract), amount) => {
                let senders = self.token_balances.read().expect("balance lock poisoned");
                if let Some(sender) = senders.get(&contract) {
                    Self::set_if_changed(sender, Some(amount));
                }
            }
            SyncEvent::Transactions(asset, transactions) => {
                if transactions.is_empty() {
                    return;
                }
                let mut subscribers = self
                    .transaction_subscribers
                    .lock()
                    .expect("subscriber lock poisoned");
                subscribers.retain(|subscriber| {
                    subscriber.send((asset, transactions.clone())).is_ok()
                });
            }
        }
    }

    fn reset(&self) {
        Self::set_if_changed(&self.last_block_height, None);
        Self::set_if_changed(&self.sync_status, SyncStatus::NotSynced(None));
        Self::set_if_changed(&self.native_balance, None);
        for sender in self
            .token_balances
            .read()
            .expect("balance lock poisoned")
            .values()
        {
            Self::set_if_changed(sender, None);
        }
        for sender in self
            .token_status
            .read()
            .expect("status lock poisoned")
            .values()
        {
            Self::set_if_changed(sender, SyncStatus::NotSynced(None));
        }
    }
}

/// The wallet-kit controller: one per wallet.
pub struct EthereumClient {
    pub config: EmberConfig,
    /// Wallet data.
    pub wallet: Arc<RwLock<EthereumWallet>>,
    address: Address,
    sync_mode: Arc<AtomicU8>,
    sync_handle: Option<JoinHandle<Result<(), SyncError<WalletError>>>>,
    dispatch_handle: Option<JoinHandle<()>>,
    backend_requests: Option<mpsc::UnboundedSender<BackendRequest>>,
    tokens: Arc<RwLock<BTreeSet<Address>>>,
    streams: Arc<Streams>,
    // serialises nonce assignment across concurrent sends
    send_guard: Mutex<()>,
}

impl EthereumClient {
    /// Creates a client from a wallet and config.
    #[must_use]
    pub fn create_from_wallet(wallet: EthereumWallet, config: EmberConfig) -> Self {
        let address = wallet.address();

        EthereumClient {
            config,
            wallet: Arc::new(RwLock::new(wallet)),
            address,
            sync_mode: Arc::new(AtomicU8::new(
                ember_sync::wallet::SyncMode::NotRunning as u8,
            )),
            sync_handle: None,
            dispatch_handle: None,
            backend_requests: None,
            tokens: Arc::new(RwLock::new(BTreeSet::new())),
            streams: Arc::new(Streams::new()),
            send_guard: Mutex::new(()),
        }
    }

    /// Creates a client with a fresh wallet from a 32-byte secret key.
    pub fn new(config: EmberConfig, secret: &[u8; 32]) -> Result<Self, ClientError> {
        Ok(Self::create_from_wallet(EthereumWallet::new(secret)?, config))
    }

    /// Returns config used to create the client.
    #[must_use]
    pub fn config(&self) -> &EmberConfig {
        &self.config
    }

    /// The account's receive address.
    #[must_use]
    pub fn receive_address(&self) -> Address {
        self.address
    }

    /// Validates an address string, enforcing EIP-55 on mixed-case input.
    pub fn validate_address(input: &str) -> Result<Address, AddressError> {
        Address::parse(input)
    }

    /// The fee for a transfer at `gas_price`: native transfers cost 21 000
    /// gas, ERC-20 transfers are budgeted at 100 000 by default.
    #[must_use]
    pub fn fee(&self, gas_price: u64, asset: &Asset) -> BigUint {
        let gas_limit = match asset {
            Asset::Native => self.config.gas.native_gas_limit,
            Asset::Erc20(_) => self.config.gas.erc20_gas_limit,
        };

        BigUint::from(gas_price) * BigUint::from(gas_limit)
    }

    /// The stored native balance.
    pub async fn balance(&self) -> Option<BigUint> {
        infallible(self.wallet.read().await.balance(&Asset::Native))
    }

    /// The stored balance of a registered ERC-20.
    pub async fn erc20_balance(&self, contract: Address) -> Option<BigUint> {
        infallible(self.wallet.read().await.balance(&Asset::Erc20(contract)))
    }

    /// The last persisted chain height.
    pub async fn last_block_height(&self) -> Option<u64> {
        use ember_sync::wallet::traits::SyncHeight;

        infallible(self.wallet.read().await.last_block_height())
    }

    /// The current sync status of the native asset.
    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.streams.sync_status.borrow().clone()
    }

    /// Queries the transaction log newest-first.
    pub async fn transactions(
        &self,
        from_hash: Option<Hash32>,
        limit: Option<usize>,
        asset: Option<Asset>,
    ) -> Vec<Transaction> {
        infallible(
            self.wallet
                .read()
                .await
                .transactions(from_hash, limit, asset.as_ref()),
        )
    }

    /// Looks a single transaction up by hash.
    pub async fn transaction(&self, hash: Hash32) -> Option<Transaction> {
        infallible(self.wallet.read().await.transaction(&hash))
    }

    /// Registers an ERC-20 contract for balance and transaction sync.
    ///
    /// Registration is idempotent: re-registering an existing contract is a
    /// no-op and keeps its existing streams.
    pub async fn register_erc20(&self, contract: Address) -> bool {
        let mut tokens = self.tokens.write().await;
        if !tokens.insert(contract) {
            return false;
        }

        self.streams
            .token_balances
            .write()
            .expect("balance lock poisoned")
            .entry(contract)
            .or_insert_with(|| watch::channel(None).0);
        self.streams
            .token_status
            .write()
            .expect("status lock poisoned")
            .entry(contract)
            .or_insert_with(|| watch::channel(SyncStatus::NotSynced(None)).0);

        true
    }

    /// Removes an ERC-20 contract from sync and closes its streams.
    pub async fn unregister_erc20(&self, contract: Address) -> bool {
        let removed = self.tokens.write().await.remove(&contract);
        if removed {
            self.streams
                .token_balances
                .write()
                .expect("balance lock poisoned")
                .remove(&contract);
            self.streams
                .token_status
                .write()
                .expect("status lock poisoned")
                .remove(&contract);
        }

        removed
    }

    /// Subscribes to chain-height updates.
    #[must_use]
    pub fn last_block_height_stream(&self) -> watch::Receiver<Option<u64>> {
        self.streams.last_block_height.subscribe()
    }

    /// Subscribes to native sync-status updates.
    #[must_use]
    pub fn sync_status_stream(&self) -> watch::Receiver<SyncStatus> {
        self.streams.sync_status.subscribe()
    }

    /// Subscribes to native balance updates.
    #[must_use]
    pub fn balance_stream(&self) -> watch::Receiver<Option<BigUint>> {
        self.streams.native_balance.subscribe()
    }

    /// Subscribes to a registered ERC-20's balance updates.
    #[must_use]
    pub fn erc20_balance_stream(
        &self,
        contract: Address,
    ) -> Option<watch::Receiver<Option<BigUint>>> {
        self.streams
            .token_balances
            .read()
            .expect("balance lock poisoned")
            .get(&contract)
            .map(watch::Sender::subscribe)
    }

    /// Subscribes to transaction batches across all tracked assets. Batches
    /// are always non-empty and are never dropped.
    #[must_use]
    pub fn transactions_stream(&self) -> mpsc::UnboundedReceiver<(Asset, Vec<Transaction>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.streams
            .transaction_subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(sender);

        receiver
    }

    pub(crate) fn backend(
        &self,
    ) -> Result<&mpsc::UnboundedSender<BackendRequest>, ClientError> {
        self.backend_requests
            .as_ref()
            .ok_or(ClientError::SyncModeError(SyncModeError::SyncNotRunning))
    }

    pub(crate) async fn backend_request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, RequestError>>) -> BackendRequest,
    ) -> Result<T, ClientError> {
        let backend = self.backend()?;
        let (reply_sender, reply_receiver) = oneshot::channel();
        backend
            .send(build(reply_sender))
            .map_err(|_| RequestError::Cancelled)?;

        Ok(reply_receiver
            .await
            .map_err(|_| RequestError::Cancelled)??)
    }

    /// The remote's gas price suggestion in wei.
    pub async fn gas_price(&self) -> Result<u64, ClientError> {
        self.backend_request(BackendRequest::GasPrice).await
    }

    /// Executes a read-only contract call. Unsupported on SPV.
    pub async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        self.backend_request(|reply| {
            BackendRequest::Call(
                reply,
                CallRequest {
                    from: None,
                    to,
                    value: None,
                    data,
                },
            )
        })
        .await
    }

    /// Estimates the gas a call would consume. Unsupported on SPV.
    pub async fn estimate_gas(&self, request: CallRequest) -> Result<u64, ClientError> {
        self.backend_request(|reply| BackendRequest::EstimateGas(reply, request))
            .await
    }

    /// Fetches log entries matching `filter`. Unsupported on SPV.
    pub async fn get_logs(&self, filter: LogFilter) -> Result<Vec<LogEntry>, ClientError> {
        self.backend_request(|reply| BackendRequest::GetLogs(reply, filter))
            .await
    }
}

impl std::fmt::Debug for EthereumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthereumClient")
            .field("chain", &self.config.chain)
            .field("address", &self.address)
            .field("sync_mode", &self.sync_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use ember_status::sync_status::SyncStatus;
    use ember_sync::primitives::{Address, AddressError, Hash32};
    use ember_sync::sync::SyncEvent;
    use ember_sync::transaction::Transaction;
    use ember_sync::wallet::Asset;

    use crate::config::{ChainType, EmberConfig};

    use super::EthereumClient;

    fn test_client() -> EthereumClient {
        EthereumClient::new(
            EmberConfig::build(ChainType::Ropsten).create(),
            &[0x46; 32],
        )
        .unwrap()
    }

    #[test]
    fn validate_address_applies_eip55() {
        EthereumClient::validate_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        assert_eq!(
            EthereumClient::validate_address("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
            Err(AddressError::Checksum)
        );
        EthereumClient::validate_address("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap();
    }

    #[test]
    fn fee_uses_the_gas_table() {
        let client = test_client();
        assert_eq!(
            client.fee(20_000_000_000, &Asset::Native),
            BigUint::from(20_000_000_000u64) * BigUint::from(21_000u64)
        );
        assert_eq!(
            client.fee(20_000_000_000, &Asset::Erc20(Address::new([9; 20]))),
            BigUint::from(20_000_000_000u64) * BigUint::from(100_000u64)
        );
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let client = test_client();
        let contract = Address::new([0xaa; 20]);

        assert!(client.register_erc20(contract).await);
        let stream = client.erc20_balance_stream(contract).unwrap();
        // re-registering neither fails nor replaces the existing stream
        assert!(!client.register_erc20(contract).await);
        assert!(client.erc20_balance_stream(contract).is_some());
        drop(stream);

        assert!(client.unregister_erc20(contract).await);
        assert!(!client.unregister_erc20(contract).await);
        assert!(client.erc20_balance_stream(contract).is_none());
    }

    #[tokio::test]
    async fn dispatch_dedups_by_value() {
        let client = test_client();
        let mut heights = client.last_block_height_stream();
        let mut statuses = client.sync_status_stream();

        client.streams.dispatch(SyncEvent::LastBlockHeight(100));
        client.streams.dispatch(SyncEvent::LastBlockHeight(100));
        client
            .streams
            .dispatch(SyncEvent::Status(Asset::Native, SyncStatus::Synced));
        client
            .streams
            .dispatch(SyncEvent::Status(Asset::Native, SyncStatus::Synced));

        assert!(heights.has_changed().unwrap());
        assert_eq!(*heights.borrow_and_update(), Some(100));
        // the duplicate did not re-mark the channel
        assert!(!heights.has_changed().unwrap());

        assert!(statuses.has_changed().unwrap());
        assert_eq!(*statuses.borrow_and_update(), SyncStatus::Synced);
        assert!(!statuses.has_changed().unwrap());
    }

    #[tokio::test]
    async fn empty_transaction_batches_are_not_delivered() {
        let client = test_client();
        let mut transactions = client.transactions_stream();

        client
            .streams
            .dispatch(SyncEvent::Transactions(Asset::Native, Vec::new()));
        assert!(transactions.try_recv().is_err());

        let transaction = Transaction {
            hash: Hash32::new([1; 32]),
            nonce: 0,
            from: Address::new([1; 20]),
            to: Address::new([2; 20]),
            value: BigUint::from(1u32),
            gas_price: 1,
            gas_limit: 21_000,
            input: Vec::new(),
            timestamp: 0,
            block_height: Some(1),
        };
        client
            .streams
            .dispatch(SyncEvent::Transactions(Asset::Native, vec![transaction]));
        assert_eq!(transactions.try_recv().unwrap().1.len(), 1);
    }
}
