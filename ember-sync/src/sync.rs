//! Entrypoint for the sync engine.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8};
use std::time::Duration;

use num_bigint::BigUint;
use rand::Rng;
use secp256k1::PublicKey;
use tokio::sync::{RwLock, mpsc, oneshot};

use ember_status::sync_status::SyncStatus;

use crate::ChainParameters;
use crate::client::fetch::ApiClient;
use crate::client::{CallRequest, LogEntry, LogFilter};
use crate::config::SyncConfig;
use crate::error::{RequestError, SyncError, SyncModeError};
use crate::primitives::{Address, Hash32};
use crate::transaction::Transaction;
use crate::wallet::traits::{
    SyncAccount, SyncBalances, SyncHeaders, SyncHeight, SyncTransactions, SyncWallet,
};
use crate::wallet::{Asset, SyncMode};

pub(crate) mod api;
pub(crate) mod spv;

/// Events pushed by the running back-end, in observation order.
///
/// A [`SyncEvent::LastBlockHeight`] for height `h` always precedes balance or
/// transaction events derived from blocks at or below `h`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A new chain height was observed and persisted.
    LastBlockHeight(u64),
    /// The sync status of one tracked asset changed.
    Status(Asset, SyncStatus),
    /// A balance was learned for one tracked asset.
    Balance(Asset, BigUint),
    /// New or newly confirmed transactions for one tracked asset.
    Transactions(Asset, Vec<Transaction>),
}

/// Request/response operations served by the running back-end.
///
/// Operations a back-end cannot serve fail fast with
/// [`RequestError::Unsupported`]; a dropped reply means the back-end stopped
/// and surfaces as [`RequestError::Cancelled`].
#[derive(Debug)]
pub enum BackendRequest {
    /// Bring the next poll or head check forward to now.
    Refresh,
    /// The account's next nonce.
    TransactionCount(oneshot::Sender<Result<u64, RequestError>>),
    /// Broadcast a signed transaction.
    SendRawTransaction(oneshot::Sender<Result<Hash32, RequestError>>, Vec<u8>),
    /// The remote's gas price suggestion.
    GasPrice(oneshot::Sender<Result<u64, RequestError>>),
    /// Read-only contract call. API back-end only.
    Call(oneshot::Sender<Result<Vec<u8>, RequestError>>, CallRequest),
    /// Gas estimation. API back-end only.
    EstimateGas(oneshot::Sender<Result<u64, RequestError>>, CallRequest),
    /// Log query. API back-end only.
    GetLogs(oneshot::Sender<Result<Vec<LogEntry>, RequestError>>, LogFilter),
}

/// The remote data source a controller syncs from. Exactly one is live per
/// controller instance.
#[derive(Debug, Clone)]
pub enum SyncSource {
    /// A JSON-RPC node paired with an Etherscan-style transaction index.
    Api {
        /// JSON-RPC endpoint.
        rpc_url: http::Uri,
        /// Transaction index endpoint.
        index_url: http::Uri,
        /// Transaction index API key.
        api_key: Option<String>,
    },
    /// A single devp2p/LES peer, verified locally.
    Spv {
        /// Peer socket address.
        address: SocketAddr,
        /// Peer static public key.
        remote_public: PublicKey,
    },
}

/// Syncs an account projection to the latest state of the blockchain.
///
/// `sync_mode` is intended to be stored in the struct that owns the wallet
/// and has a non-atomic counterpart [`SyncMode`]. The engine sets it to
/// `Running` on entry; the consumer is required to set it back to
/// `NotRunning` once this future resolves. Set it to `Shutdown` to stop the
/// back-end: in-flight request futures resolve with
/// [`RequestError::Cancelled`] and the last acknowledged height stays
/// persisted.
#[allow(clippy::too_many_arguments)]
pub async fn sync<P, W>(
    source: SyncSource,
    parameters: &P,
    address: Address,
    tokens: Arc<RwLock<BTreeSet<Address>>>,
    wallet: Arc<RwLock<W>>,
    events: mpsc::UnboundedSender<SyncEvent>,
    requests: mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: Arc<AtomicU8>,
    config: SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    P: ChainParameters + Sync + Send,
    W: SyncWallet
        + SyncHeight
        + SyncBalances
        + SyncTransactions
        + SyncHeaders
        + SyncAccount
        + Send
        + Sync
        + 'static,
{
    let sync_mode_enum = SyncMode::from_atomic_u8(sync_mode.clone())?;
    if sync_mode_enum == SyncMode::NotRunning {
        sync_mode.store(SyncMode::Running as u8, atomic::Ordering::Release);
    } else {
        return Err(SyncModeError::SyncAlreadyRunning.into());
    }

    tracing::info!("Starting sync...");

    let result = match source {
        SyncSource::Api {
            rpc_url,
            index_url,
            api_key,
        } => {
            let client = ApiClient::new(rpc_url, index_url, api_key);
            api::run(client, address, tokens, wallet, &events, requests, sync_mode, config).await
        }
        SyncSource::Spv {
            address: peer_address,
            remote_public,
        } => {
            spv::run(
                peer_address,
                remote_public,
                parameters,
                address,
                wallet,
                &events,
                requests,
                sync_mode,
                config,
            )
            .await
        }
    };

    match &result {
        Ok(()) => emit(&events, SyncEvent::Status(Asset::Native, SyncStatus::NotSynced(None))),
        Err(error) => emit(
            &events,
            SyncEvent::Status(Asset::Native, SyncStatus::NotSynced(Some(error.to_string()))),
        ),
    }

    result
}

// Event delivery is best effort; the consumer may have dropped the receiver
// during clear().
pub(crate) fn emit(events: &mpsc::UnboundedSender<SyncEvent>, event: SyncEvent) {
    let _ignore_error = events.send(event);
}

pub(crate) fn is_shutdown(sync_mode: &Arc<AtomicU8>) -> bool {
    matches!(
        SyncMode::from_atomic_u8(sync_mode.clone()),
        Ok(SyncMode::Shutdown)
    )
}

// Resolves to `None` if shutdown is requested while `operation` is pending;
// the dropped future abandons whatever it had in flight.
pub(crate) async fn race_shutdown<F, T>(operation: F, sync_mode: &Arc<AtomicU8>) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    tokio::pin!(operation);
    loop {
        tokio::select! {
            outcome = &mut operation => return Some(outcome),
            _ = ticker.tick() => {
                if is_shutdown(sync_mode) {
                    return None;
                }
            }
        }
    }
}

/// Capped exponential backoff with full jitter.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The next delay: a uniform sample of `[0, min(cap, base · 2^attempt)]`.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(16);
        self.attempts += 1;
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);

        rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Backoff;

    #[test]
    fn backoff_stays_under_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
        assert_eq!(backoff.attempts(), 20);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        // first delay is bounded by the base
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }
}
