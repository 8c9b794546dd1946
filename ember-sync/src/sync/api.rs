//! The API back-end: periodic polling of a JSON-RPC node and an
//! Etherscan-style transaction index.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

use ember_status::sync_status::SyncStatus;

use crate::client::fetch::ApiClient;
use crate::client::{self, FetchRequest, TransactionPageRequest};
use crate::config::SyncConfig;
use crate::error::{RequestError, SyncError};
use crate::primitives::Address;
use crate::sync::{Backoff, BackendRequest, SyncEvent, emit, is_shutdown, race_shutdown};
use crate::wallet::traits::{
    SyncAccount, SyncBalances, SyncHeight, SyncTransactions, SyncWallet,
};
use crate::wallet::{AccountState, Asset, TransactionRecord};

// consecutive failed cycles before the failure is surfaced as NotSynced
const SUSTAINED_FAILURE_THRESHOLD: u32 = 3;

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run<W>(
    client: ApiClient,
    address: Address,
    tokens: Arc<RwLock<BTreeSet<Address>>>,
    wallet: Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    mut requests: mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: Arc<AtomicU8>,
    config: SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncBalances + SyncTransactions + SyncAccount + Send + Sync,
{
    // all remote traffic flows through one fetcher task
    let (fetch_request_sender, fetch_request_receiver) = mpsc::unbounded_channel();
    let fetcher_handle =
        tokio::spawn(async move { client::fetch::fetch(fetch_request_receiver, client).await });

    let result = run_loop(
        &fetch_request_sender,
        address,
        tokens,
        wallet,
        events,
        &mut requests,
        sync_mode,
        config,
    )
    .await;

    // closing the request channel lets the fetcher drain and exit
    drop(fetch_request_sender);
    if tokio::time::timeout(Duration::from_secs(5), fetcher_handle)
        .await
        .is_err()
    {
        tracing::warn!("Fetcher task did not stop within the shutdown deadline.");
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<W>(
    fetch_request_sender: &mpsc::UnboundedSender<FetchRequest>,
    address: Address,
    tokens: Arc<RwLock<BTreeSet<Address>>>,
    wallet: Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    requests: &mut mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: Arc<AtomicU8>,
    config: SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncBalances + SyncTransactions + SyncAccount + Send + Sync,
{
    emit(events, SyncEvent::Status(Asset::Native, SyncStatus::Syncing(None)));

    let mut backoff = Backoff::new(config.api_retry_base, config.api_retry_cap);
    let mut next_poll = Instant::now();
    let result = loop {
        if is_shutdown(&sync_mode) {
            tracing::info!("Sync shutting down.");
            break Ok(());
        }

        tokio::select! {
            request = requests.recv() => match request {
                Some(BackendRequest::Refresh) => next_poll = Instant::now(),
                Some(request) => {
                    handle_request(request, fetch_request_sender, address).await;
                }
                // the controller dropped its handle; treat as shutdown
                None => break Ok(()),
            },
            _ = tokio::time::sleep_until(next_poll) => {
                let cycle = poll_cycle(
                    fetch_request_sender,
                    address,
                    &tokens,
                    &wallet,
                    events,
                    &config,
                );
                // shutdown mid-cycle drops the cycle future: an in-flight
                // page is abandoned, never partially persisted
                let Some(outcome) = race_shutdown(cycle, &sync_mode).await else {
                    break Ok(());
                };
                match outcome {
                    Ok(()) => {
                        backoff.reset();
                        emit(events, SyncEvent::Status(Asset::Native, SyncStatus::Synced));
                        next_poll = Instant::now() + config.poll_interval;
                    }
                    Err(SyncError::ServerError(error)) if !error.is_transient() => {
                        break Err(error.into());
                    }
                    Err(error @ SyncError::WalletError(_)) => break Err(error),
                    Err(error) => {
                        tracing::warn!("Sync cycle failed, backing off. {error}");
                        if backoff.attempts() + 1 >= SUSTAINED_FAILURE_THRESHOLD {
                            emit(
                                events,
                                SyncEvent::Status(
                                    Asset::Native,
                                    SyncStatus::NotSynced(Some(error.to_string())),
                                ),
                            );
                        }
                        next_poll = Instant::now() + backoff.next_delay();
                    }
                }
            },
            // bounded shutdown latency while sleeping towards the next poll
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    };

    result
}

// One pass of the polling sequence: height, balance, nonce, then the
// transaction index pages, emitting in that order.
async fn poll_cycle<W>(
    fetch_request_sender: &mpsc::UnboundedSender<FetchRequest>,
    address: Address,
    tokens: &Arc<RwLock<BTreeSet<Address>>>,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    config: &SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncBalances + SyncTransactions + SyncAccount + Send + Sync,
{
    let height = client::get_block_number(fetch_request_sender.clone()).await?;
    let previous_height = {
        let wallet_guard = wallet.read().await;
        wallet_guard
            .last_block_height()
            .map_err(SyncError::WalletError)?
    };
    wallet
        .write()
        .await
        .set_last_block_height(height)
        .map_err(SyncError::WalletError)?;
    emit(events, SyncEvent::LastBlockHeight(height));

    let balance = client::get_balance(fetch_request_sender.clone(), address).await?;
    let balance_changed = wallet
        .write()
        .await
        .update_balance(Asset::Native, balance.clone(), height)
        .map_err(SyncError::WalletError)?;
    if balance_changed {
        emit(events, SyncEvent::Balance(Asset::Native, balance.clone()));
    }

    let nonce = client::get_transaction_count(fetch_request_sender.clone(), address).await?;
    wallet
        .write()
        .await
        .set_account_state(AccountState {
            nonce,
            balance,
            ..AccountState::empty()
        })
        .map_err(SyncError::WalletError)?;

    let start_block = previous_height.map_or(0, |height| height + 1);
    page_index(
        fetch_request_sender,
        address,
        Asset::Native,
        start_block,
        wallet,
        events,
        config,
    )
    .await?;

    let token_list: Vec<Address> = tokens.read().await.iter().copied().collect();
    for contract in token_list {
        let asset = Asset::Erc20(contract);
        let token_balance =
            client::get_erc20_balance(fetch_request_sender.clone(), contract, address).await?;
        let token_balance_changed = wallet
            .write()
            .await
            .update_balance(asset, token_balance.clone(), height)
            .map_err(SyncError::WalletError)?;
        if token_balance_changed {
            emit(events, SyncEvent::Balance(asset, token_balance));
        }

        page_index(
            fetch_request_sender,
            address,
            asset,
            start_block,
            wallet,
            events,
            config,
        )
        .await?;
        emit(events, SyncEvent::Status(asset, SyncStatus::Synced));
    }

    Ok(())
}

// Pages one index forward from `start_block` until an empty or short page.
// Each page is persisted whole before the next is requested.
async fn page_index<W>(
    fetch_request_sender: &mpsc::UnboundedSender<FetchRequest>,
    address: Address,
    asset: Asset,
    start_block: u64,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    config: &SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncTransactions + Send + Sync,
{
    let mut page = 1;
    loop {
        let transactions = client::get_transaction_page(
            fetch_request_sender.clone(),
            TransactionPageRequest {
                address,
                start_block,
                page,
                offset: config.index_page_size,
                asset,
            },
        )
        .await?;
        if transactions.is_empty() {
            break;
        }
        let page_len = transactions.len() as u64;

        let records = transactions
            .into_iter()
            .map(|transaction| TransactionRecord { transaction, asset })
            .collect();
        let changed = wallet
            .write()
            .await
            .insert_transactions(records)
            .map_err(SyncError::WalletError)?;
        if !changed.is_empty() {
            emit(
                events,
                SyncEvent::Transactions(
                    asset,
                    changed.into_iter().map(|record| record.transaction).collect(),
                ),
            );
        }

        if page_len < config.index_page_size {
            break;
        }
        page += 1;
    }

    Ok(())
}

// Per-operation requests fail fast; nothing here is retried.
async fn handle_request(
    request: BackendRequest,
    fetch_request_sender: &mpsc::UnboundedSender<FetchRequest>,
    address: Address,
) {
    match request {
        // handled by the caller, it needs the poll timer
        BackendRequest::Refresh => {}
        BackendRequest::TransactionCount(reply) => {
            let result = client::get_transaction_count(fetch_request_sender.clone(), address)
                .await
                .map_err(RequestError::from);
            let _ignore_error = reply.send(result);
        }
        BackendRequest::SendRawTransaction(reply, encoded) => {
            let result = client::send_raw_transaction(fetch_request_sender.clone(), encoded)
                .await
                .map_err(RequestError::from);
            let _ignore_error = reply.send(result);
        }
        BackendRequest::GasPrice(reply) => {
            let result = client::get_gas_price(fetch_request_sender.clone())
                .await
                .map_err(RequestError::from);
            let _ignore_error = reply.send(result);
        }
        BackendRequest::Call(reply, call_request) => {
            let result = client::call(fetch_request_sender.clone(), call_request)
                .await
                .map_err(RequestError::from);
            let _ignore_error = reply.send(result);
        }
        BackendRequest::EstimateGas(reply, call_request) => {
            let result = client::estimate_gas(fetch_request_sender.clone(), call_request)
                .await
                .map_err(RequestError::from);
            let _ignore_error = reply.send(result);
        }
        BackendRequest::GetLogs(reply, filter) => {
            let result = client::get_logs(fetch_request_sender.clone(), filter)
                .await
                .map_err(RequestError::from);
            let _ignore_error = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{self, AtomicU8};
    use std::time::Duration;

    use num_bigint::BigUint;
    use tokio::sync::{RwLock, mpsc};

    use ember_status::sync_status::SyncStatus;

    use crate::client::FetchRequest;
    use crate::config::SyncConfig;
    use crate::mocks::TestWallet;
    use crate::primitives::Address;
    use crate::sync::{BackendRequest, SyncEvent};
    use crate::wallet::traits::SyncBalances;
    use crate::wallet::{Asset, SyncMode};

    fn one_ether() -> BigUint {
        BigUint::from(1_000_000_000_000_000_000u64)
    }

    // A remote that answers like a quiet Ropsten node.
    fn spawn_quiet_remote(mut receiver: mpsc::UnboundedReceiver<FetchRequest>) {
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                match request {
                    FetchRequest::BlockNumber(reply) => {
                        let _ = reply.send(Ok(5_200_000));
                    }
                    FetchRequest::Balance(reply, _) => {
                        let _ = reply.send(Ok(one_ether()));
                    }
                    FetchRequest::TransactionCount(reply, _) => {
                        let _ = reply.send(Ok(0));
                    }
                    FetchRequest::TransactionPage(reply, _) => {
                        let _ = reply.send(Ok(Vec::new()));
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn cold_start_reaches_synced() {
        let (fetch_sender, fetch_receiver) = mpsc::unbounded_channel();
        spawn_quiet_remote(fetch_receiver);

        let wallet = Arc::new(RwLock::new(TestWallet::default()));
        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
        let (request_sender, mut requests) = mpsc::unbounded_channel::<BackendRequest>();
        let sync_mode = Arc::new(AtomicU8::new(SyncMode::Running as u8));

        let stopper = sync_mode.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.store(SyncMode::Shutdown as u8, atomic::Ordering::Release);
        });

        super::run_loop(
            &fetch_sender,
            Address::new([0x11; 20]),
            Arc::new(RwLock::new(BTreeSet::new())),
            wallet.clone(),
            &event_sender,
            &mut requests,
            sync_mode,
            SyncConfig::fast(),
        )
        .await
        .unwrap();
        drop(request_sender);

        let wallet_guard = wallet.read().await;
        assert_eq!(wallet_guard.last_block_height, Some(5_200_000));
        assert_eq!(
            wallet_guard.balance(&Asset::Native).unwrap(),
            Some(one_ether())
        );
        assert_eq!(wallet_guard.account_state.as_ref().unwrap().nonce, 0);

        let mut events = Vec::new();
        while let Ok(event) = event_receiver.try_recv() {
            events.push(event);
        }
        let height_at = events
            .iter()
            .position(|event| matches!(event, SyncEvent::LastBlockHeight(5_200_000)))
            .expect("height event emitted");
        let balance_at = events
            .iter()
            .position(|event| matches!(event, SyncEvent::Balance(Asset::Native, _)))
            .expect("balance event emitted");
        // a balance is never observed before the height it derives from
        assert!(height_at < balance_at);
        assert!(events.contains(&SyncEvent::Status(Asset::Native, SyncStatus::Synced)));
        // empty index pages produce no transaction events
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, SyncEvent::Transactions(_, _)))
        );
    }

    #[tokio::test]
    async fn stop_mid_page_fetch_persists_no_partial_batch() {
        let (fetch_sender, mut fetch_receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(request) = fetch_receiver.recv().await {
                match request {
                    FetchRequest::BlockNumber(reply) => {
                        let _ = reply.send(Ok(100));
                    }
                    FetchRequest::Balance(reply, _) => {
                        let _ = reply.send(Ok(BigUint::default()));
                    }
                    FetchRequest::TransactionCount(reply, _) => {
                        let _ = reply.send(Ok(0));
                    }
                    FetchRequest::TransactionPage(reply, _) => {
                        // the page fetch hangs; the reply is dropped when the
                        // cycle is cancelled
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            let _ = reply.send(Ok(Vec::new()));
                        });
                    }
                    _ => {}
                }
            }
        });

        let wallet = Arc::new(RwLock::new(TestWallet::default()));
        let (event_sender, _event_receiver) = mpsc::unbounded_channel();
        let (_request_sender, mut requests) = mpsc::unbounded_channel::<BackendRequest>();
        let sync_mode = Arc::new(AtomicU8::new(SyncMode::Running as u8));

        let stopper = sync_mode.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.store(SyncMode::Shutdown as u8, atomic::Ordering::Release);
        });

        let started = std::time::Instant::now();
        super::run_loop(
            &fetch_sender,
            Address::new([0x22; 20]),
            Arc::new(RwLock::new(BTreeSet::new())),
            wallet.clone(),
            &event_sender,
            &mut requests,
            sync_mode,
            SyncConfig::fast(),
        )
        .await
        .unwrap();

        // the hung page did not hold shutdown hostage
        assert!(started.elapsed() < Duration::from_secs(5));
        let wallet_guard = wallet.read().await;
        assert!(wallet_guard.transactions.is_empty());
        // the height acknowledged before the stop stays persisted
        assert_eq!(wallet_guard.last_block_height, Some(100));
    }
}
