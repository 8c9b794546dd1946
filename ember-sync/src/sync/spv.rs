//! The SPV back-end: drives a single LES peer, verifies the header chain
//! from the compiled-in checkpoint and proves the account against the head
//! state root.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

use num_bigint::BigUint;
use secp256k1::PublicKey;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

use ember_status::sync_status::SyncStatus;

use crate::ChainParameters;
use crate::config::SyncConfig;
use crate::crypto::{generate_keypair, keccak256};
use crate::error::{ProtocolError, RequestError, StateError, SyncError};
use crate::header::{BlockHeader, Checkpoint, verify_continuity};
use crate::p2p::les::{self, BlockHeaders, LesStatus, Proofs};
use crate::p2p::peer::{
    PING_INTERVAL, PONG_DEADLINE, Peer, PeerConfig, PeerReader, PeerWriter,
};
use crate::p2p::{CAPABILITY_OFFSET, DISCONNECT, DisconnectReason, PING, PONG};
use crate::primitives::{Address, Hash32};
use crate::sync::{Backoff, BackendRequest, SyncEvent, emit, is_shutdown, race_shutdown};
use crate::trie::verify_account_proof;
use crate::wallet::traits::{
    SyncAccount, SyncBalances, SyncHeaders, SyncHeight, SyncWallet,
};
use crate::wallet::Asset;

// consecutive failed connection attempts before NotSynced is surfaced
const SUSTAINED_FAILURE_THRESHOLD: u32 = 3;
// deadline for dial + handshakes
const CONNECT_DEADLINE: Duration = Duration::from_secs(30);
// deadline for a pipelined response during header sync
const RESPONSE_DEADLINE: Duration = Duration::from_secs(30);

type Inbound = mpsc::Receiver<Result<(u64, Vec<u8>), ProtocolError>>;

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run<P, W>(
    peer_address: SocketAddr,
    remote_public: PublicKey,
    parameters: &P,
    address: Address,
    wallet: Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    mut requests: mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: Arc<AtomicU8>,
    config: SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    P: ChainParameters + Sync + Send,
    W: SyncWallet + SyncHeight + SyncBalances + SyncHeaders + SyncAccount + Send + Sync,
{
    let checkpoint = parameters.checkpoint();
    let mut backoff = Backoff::new(config.peer_retry_base, config.peer_retry_cap);

    // fresh devp2p identity per back-end instance
    let (identity_key, identity_public) = generate_keypair();
    let mut node_id = [0u8; 64];
    node_id.copy_from_slice(&identity_public.serialize_uncompressed()[1..]);

    loop {
        if is_shutdown(&sync_mode) {
            return Ok(());
        }

        let (head_number, head_hash, head_total_difficulty) =
            anchor(&wallet, &checkpoint).await.map_err(SyncError::WalletError)?;
        let peer_config = PeerConfig {
            address: peer_address,
            remote_public,
            client_id: crate::client_id(),
            network_id: parameters.network_id(),
            genesis_hash: parameters.genesis_hash(),
            head_number,
            head_hash,
            head_total_difficulty,
        };

        emit(events, SyncEvent::Status(Asset::Native, SyncStatus::Syncing(None)));
        let connect = tokio::time::timeout(
            CONNECT_DEADLINE,
            Peer::connect(&peer_config, &identity_key, node_id),
        );
        let Some(connected) = race_shutdown(connect, &sync_mode).await else {
            return Ok(());
        };

        let error = match connected {
            Ok(Ok(peer)) => {
                backoff.reset();
                match session(
                    peer,
                    &checkpoint,
                    address,
                    &wallet,
                    events,
                    &mut requests,
                    &sync_mode,
                    &config,
                )
                .await
                {
                    // shutdown requested
                    Ok(()) => return Ok(()),
                    Err(SyncError::StateError(error)) => {
                        // the local projection is broken; restart the chain
                        // from the checkpoint
                        tracing::warn!("State error, resetting to checkpoint. {error}");
                        let mut wallet_guard = wallet.write().await;
                        wallet_guard
                            .header_store_mut()
                            .map_err(SyncError::WalletError)?
                            .clear();
                        drop(wallet_guard);
                        continue;
                    }
                    Err(error @ SyncError::WalletError(_)) => return Err(error),
                    Err(error) => error,
                }
            }
            Ok(Err(error)) => error.into(),
            Err(_elapsed) => SyncError::ProtocolError(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer connect timed out",
            ))),
        };

        tracing::warn!("Peer session failed, reconnecting after backoff. {error}");
        if backoff.attempts() + 1 >= SUSTAINED_FAILURE_THRESHOLD {
            emit(
                events,
                SyncEvent::Status(Asset::Native, SyncStatus::NotSynced(Some(error.to_string()))),
            );
        }
        let delay = backoff.next_delay();
        if race_shutdown(tokio::time::sleep(delay), &sync_mode)
            .await
            .is_none()
        {
            return Ok(());
        }
    }
}

async fn anchor<W>(
    wallet: &Arc<RwLock<W>>,
    checkpoint: &Checkpoint,
) -> Result<(u64, Hash32, BigUint), W::Error>
where
    W: SyncWallet + SyncHeaders,
{
    let wallet_guard = wallet.read().await;
    Ok(match wallet_guard.header_store()?.head() {
        Some(head) => (head.number, head.hash, head.total_difficulty.clone()),
        None => (
            checkpoint.number,
            checkpoint.hash,
            checkpoint.total_difficulty.clone(),
        ),
    })
}

#[allow(clippy::too_many_arguments)]
async fn session<W>(
    peer: Peer,
    checkpoint: &Checkpoint,
    address: Address,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    requests: &mut mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: &Arc<AtomicU8>,
    config: &SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncBalances + SyncHeaders + SyncAccount + Send + Sync,
{
    let status = peer
        .status()
        .cloned()
        .expect("status exchange is validated during connect");
    let (reader, mut writer) = peer.into_split();

    // a dedicated reader task owns inbound frames; recv() on the channel is
    // cancellation safe where a partial socket read would not be
    let (inbound_sender, mut inbound) = mpsc::channel(64);
    let reader_handle = tokio::spawn(read_loop(reader, inbound_sender));

    let result = drive(
        &mut writer,
        &mut inbound,
        &status,
        checkpoint,
        address,
        wallet,
        events,
        requests,
        sync_mode,
        config,
    )
    .await;
    reader_handle.abort();

    if result.is_ok() {
        // shutdown path: tell the peer we are leaving
        writer.disconnect(DisconnectReason::Requested).await;
    }

    result
}

async fn read_loop(
    mut reader: PeerReader,
    sender: mpsc::Sender<Result<(u64, Vec<u8>), ProtocolError>>,
) {
    loop {
        match reader.read_message().await {
            Ok(message) => {
                if sender.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                let _ignore_error = sender.send(Err(error)).await;
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive<W>(
    writer: &mut PeerWriter,
    inbound: &mut Inbound,
    status: &LesStatus,
    checkpoint: &Checkpoint,
    address: Address,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    requests: &mut mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: &Arc<AtomicU8>,
    config: &SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncBalances + SyncHeaders + SyncAccount + Send + Sync,
{
    if sync_headers(writer, inbound, status, checkpoint, wallet, events, sync_mode, config).await? {
        return Ok(());
    }
    if prove_account(writer, inbound, address, wallet, events, sync_mode).await? {
        return Ok(());
    }
    emit(events, SyncEvent::Status(Asset::Native, SyncStatus::Synced));

    steady(writer, inbound, checkpoint, address, wallet, events, requests, sync_mode, config).await
}

fn progress(checkpoint: &Checkpoint, verified: u64, target: u64) -> f32 {
    if target <= checkpoint.number {
        return 1.0;
    }
    (verified.saturating_sub(checkpoint.number)) as f32 / (target - checkpoint.number) as f32
}

// Pipelined forward header sync from the local anchor to the peer's head.
// Returns `Ok(true)` if shutdown was requested.
#[allow(clippy::too_many_arguments)]
async fn sync_headers<W>(
    writer: &mut PeerWriter,
    inbound: &mut Inbound,
    status: &LesStatus,
    checkpoint: &Checkpoint,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    sync_mode: &Arc<AtomicU8>,
    config: &SyncConfig,
) -> Result<bool, SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncHeaders + Send + Sync,
{
    let (mut verified_number, mut verified_hash, mut verified_total_difficulty) =
        anchor(wallet, checkpoint).await.map_err(SyncError::WalletError)?;
    let target = status.head_number;
    if target <= verified_number {
        return Ok(false);
    }
    emit(
        events,
        SyncEvent::Status(
            Asset::Native,
            SyncStatus::Syncing(Some(progress(checkpoint, verified_number, target))),
        ),
    );

    // up to `header_pipeline_depth` requests in flight, batches applied in
    // origin order
    let mut next_origin = verified_number + 1;
    let mut pending: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
    let mut ready: std::collections::HashMap<u64, Vec<BlockHeader>> =
        std::collections::HashMap::new();
    while pending.len() < config.header_pipeline_depth && next_origin <= target {
        let request_id = writer
            .request_headers(next_origin, config.header_batch_size)
            .await?;
        pending.insert(request_id, next_origin);
        next_origin += config.header_batch_size;
    }

    loop {
        if is_shutdown(sync_mode) {
            return Ok(true);
        }

        let message = tokio::time::timeout(RESPONSE_DEADLINE, inbound.recv())
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "peer response timed out",
                ))
            })?
            .ok_or(ProtocolError::PeerDropped)??;

        match message {
            (PING, _) => writer.send_pong().await?,
            (DISCONNECT, data) => {
                let reason = DisconnectReason::decode(&data)?;
                tracing::info!("Peer disconnected during header sync. {reason}");
                return Err(ProtocolError::Disconnected(reason).into());
            }
            (code, data) if code == CAPABILITY_OFFSET + les::BLOCK_HEADERS => {
                let response = BlockHeaders::decode(&data)?;
                let Some(origin) = pending.remove(&response.request_id) else {
                    continue;
                };
                ready.insert(origin, response.headers);

                while let Some(mut headers) = ready.remove(&(verified_number + 1)) {
                    if headers.is_empty() {
                        // the peer advertised a head it cannot serve
                        writer.disconnect(DisconnectReason::BadProtocol).await;
                        return Err(ProtocolError::UnexpectedMessage(code).into());
                    }
                    if let Err(continuity_error) = verify_continuity(
                        verified_number,
                        verified_hash,
                        &verified_total_difficulty,
                        &mut headers,
                    ) {
                        // the whole batch is discarded; the store still ends
                        // at the last verified header
                        writer.disconnect(DisconnectReason::BadProtocol).await;
                        return Err(ProtocolError::Continuity(continuity_error).into());
                    }

                    let last = headers.last().expect("batch is non-empty");
                    let (last_number, last_hash, last_total_difficulty) =
                        (last.number, last.hash, last.total_difficulty.clone());
                    {
                        let mut wallet_guard = wallet.write().await;
                        wallet_guard
                            .header_store_mut()
                            .map_err(SyncError::WalletError)?
                            .insert_batch(headers);
                        wallet_guard
                            .set_last_block_height(last_number)
                            .map_err(SyncError::WalletError)?;
                    }
                    verified_number = last_number;
                    verified_hash = last_hash;
                    verified_total_difficulty = last_total_difficulty;

                    emit(events, SyncEvent::LastBlockHeight(last_number));
                    emit(
                        events,
                        SyncEvent::Status(
                            Asset::Native,
                            SyncStatus::Syncing(Some(progress(
                                checkpoint,
                                verified_number,
                                target,
                            ))),
                        ),
                    );

                    if next_origin <= target && pending.len() < config.header_pipeline_depth {
                        let request_id = writer
                            .request_headers(next_origin, config.header_batch_size)
                            .await?;
                        pending.insert(request_id, next_origin);
                        next_origin += config.header_batch_size;
                    }
                }

                if verified_number >= target {
                    return Ok(false);
                }
            }
            _ => {}
        }
    }
}

// Fetches and verifies the account proof at the stored head. Returns
// `Ok(true)` if shutdown was requested.
async fn prove_account<W>(
    writer: &mut PeerWriter,
    inbound: &mut Inbound,
    address: Address,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    sync_mode: &Arc<AtomicU8>,
) -> Result<bool, SyncError<W::Error>>
where
    W: SyncWallet + SyncBalances + SyncHeaders + SyncAccount + Send + Sync,
{
    let head = {
        let wallet_guard = wallet.read().await;
        wallet_guard
            .header_store()
            .map_err(SyncError::WalletError)?
            .head()
            .cloned()
    };
    let Some(head) = head else {
        // nothing above the checkpoint yet; a stale checkpoint is an
        // operational state, not an error
        emit(
            events,
            SyncEvent::Status(Asset::Native, SyncStatus::Syncing(Some(0.0))),
        );
        return Ok(false);
    };

    let request_id = writer.request_account_proof(head.hash, address).await?;
    loop {
        if is_shutdown(sync_mode) {
            return Ok(true);
        }

        let message = tokio::time::timeout(RESPONSE_DEADLINE, inbound.recv())
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "peer response timed out",
                ))
            })?
            .ok_or(ProtocolError::PeerDropped)??;

        match message {
            (PING, _) => writer.send_pong().await?,
            (DISCONNECT, data) => {
                return Err(ProtocolError::Disconnected(DisconnectReason::decode(&data)?).into());
            }
            (code, data) if code == CAPABILITY_OFFSET + les::PROOFS => {
                let proofs = Proofs::decode(&data)?;
                if proofs.request_id != request_id {
                    continue;
                }

                let account = verify_account_proof(&head.state_root, &address, &proofs.nodes)
                    .map_err(|proof_error| SyncError::StateError(StateError::Proof(proof_error)))?;

                let balance = account.balance.clone();
                let changed = {
                    let mut wallet_guard = wallet.write().await;
                    wallet_guard
                        .set_account_state(account)
                        .map_err(SyncError::WalletError)?;
                    wallet_guard
                        .update_balance(Asset::Native, balance.clone(), head.number)
                        .map_err(SyncError::WalletError)?
                };
                if changed {
                    emit(events, SyncEvent::Balance(Asset::Native, balance));
                }

                return Ok(false);
            }
            _ => {}
        }
    }
}

// Steady state: keepalive, head polling, chain extension and request
// serving. Returns `Ok(())` only on shutdown.
#[allow(clippy::too_many_arguments)]
async fn steady<W>(
    writer: &mut PeerWriter,
    inbound: &mut Inbound,
    checkpoint: &Checkpoint,
    address: Address,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    requests: &mut mpsc::UnboundedReceiver<BackendRequest>,
    sync_mode: &Arc<AtomicU8>,
    config: &SyncConfig,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncBalances + SyncHeaders + SyncAccount + Send + Sync,
{
    let far_future = Instant::now() + Duration::from_secs(86_400);
    let mut last_inbound = Instant::now();
    let mut pong_deadline: Option<Instant> = None;
    let mut next_head_check = Instant::now() + config.poll_interval;
    let mut pending_proof: Option<u64> = None;

    loop {
        if is_shutdown(sync_mode) {
            return Ok(());
        }

        tokio::select! {
            request = requests.recv() => match request {
                Some(BackendRequest::Refresh) => next_head_check = Instant::now(),
                Some(request) => handle_request(request, writer, wallet).await?,
                // the controller dropped its handle; treat as shutdown
                None => return Ok(()),
            },
            message = inbound.recv() => {
                let (code, data) = message.ok_or(ProtocolError::PeerDropped)??;
                last_inbound = Instant::now();
                match code {
                    PING => writer.send_pong().await?,
                    PONG => pong_deadline = None,
                    DISCONNECT => {
                        let reason = DisconnectReason::decode(&data)?;
                        tracing::info!("Peer disconnected. {reason}");
                        return Err(ProtocolError::Disconnected(reason).into());
                    }
                    code if code == CAPABILITY_OFFSET + les::BLOCK_HEADERS => {
                        let response = BlockHeaders::decode(&data)?;
                        if !response.headers.is_empty() {
                            if let Some(request_id) =
                                extend_chain(writer, checkpoint, response, address, wallet, events)
                                    .await?
                            {
                                pending_proof = Some(request_id);
                            }
                        }
                    }
                    code if code == CAPABILITY_OFFSET + les::PROOFS => {
                        let proofs = Proofs::decode(&data)?;
                        if pending_proof == Some(proofs.request_id) {
                            pending_proof = None;
                            apply_proof(proofs, address, wallet, events).await?;
                            emit(events, SyncEvent::Status(Asset::Native, SyncStatus::Synced));
                        }
                    }
                    _ => {}
                }
            },
            _ = tokio::time::sleep_until(last_inbound + PING_INTERVAL),
                if pong_deadline.is_none() =>
            {
                writer.send_ping().await?;
                pong_deadline = Some(Instant::now() + PONG_DEADLINE);
            },
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or(far_future)),
                if pong_deadline.is_some() =>
            {
                writer.disconnect(DisconnectReason::TimeOut).await;
                return Err(ProtocolError::PongTimeout.into());
            },
            _ = tokio::time::sleep_until(next_head_check) => {
                let (head_number, _, _) =
                    anchor(wallet, checkpoint).await.map_err(SyncError::WalletError)?;
                writer.request_headers(head_number + 1, config.header_batch_size).await?;
                next_head_check = Instant::now() + config.poll_interval;
            },
            // bounded shutdown latency
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }
}

// Verifies and persists a chain extension, then requests a fresh account
// proof at the new head. Returns the proof request id.
async fn extend_chain<W>(
    writer: &mut PeerWriter,
    checkpoint: &Checkpoint,
    response: BlockHeaders,
    address: Address,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
) -> Result<Option<u64>, SyncError<W::Error>>
where
    W: SyncWallet + SyncHeight + SyncHeaders + Send + Sync,
{
    let (verified_number, verified_hash, verified_total_difficulty) =
        anchor(wallet, checkpoint).await.map_err(SyncError::WalletError)?;

    let mut headers = response.headers;
    if headers[0].number != verified_number + 1 {
        // answer to a stale head check
        return Ok(None);
    }
    if let Err(continuity_error) = verify_continuity(
        verified_number,
        verified_hash,
        &verified_total_difficulty,
        &mut headers,
    ) {
        writer.disconnect(DisconnectReason::BadProtocol).await;
        return Err(ProtocolError::Continuity(continuity_error).into());
    }

    let last = headers.last().expect("batch is non-empty");
    let (last_number, last_hash) = (last.number, last.hash);
    {
        let mut wallet_guard = wallet.write().await;
        wallet_guard
            .header_store_mut()
            .map_err(SyncError::WalletError)?
            .insert_batch(headers);
        wallet_guard
            .set_last_block_height(last_number)
            .map_err(SyncError::WalletError)?;
    }
    emit(events, SyncEvent::LastBlockHeight(last_number));

    let request_id = writer.request_account_proof(last_hash, address).await?;

    Ok(Some(request_id))
}

async fn apply_proof<W>(
    proofs: Proofs,
    address: Address,
    wallet: &Arc<RwLock<W>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncBalances + SyncHeaders + SyncAccount + Send + Sync,
{
    let head = {
        let wallet_guard = wallet.read().await;
        wallet_guard
            .header_store()
            .map_err(SyncError::WalletError)?
            .head()
            .cloned()
            .ok_or(SyncError::StateError(StateError::HeadMissing))?
    };

    let account = verify_account_proof(&head.state_root, &address, &proofs.nodes)
        .map_err(|proof_error| SyncError::StateError(StateError::Proof(proof_error)))?;

    let balance = account.balance.clone();
    let changed = {
        let mut wallet_guard = wallet.write().await;
        wallet_guard
            .set_account_state(account)
            .map_err(SyncError::WalletError)?;
        wallet_guard
            .update_balance(Asset::Native, balance.clone(), head.number)
            .map_err(SyncError::WalletError)?
    };
    if changed {
        emit(events, SyncEvent::Balance(Asset::Native, balance));
    }

    Ok(())
}

// `call`, `estimateGas` and `getLogs` need an execution engine or log index
// a light peer does not offer; they fail fast in this mode.
async fn handle_request<W>(
    request: BackendRequest,
    writer: &mut PeerWriter,
    wallet: &Arc<RwLock<W>>,
) -> Result<(), SyncError<W::Error>>
where
    W: SyncWallet + SyncAccount + Send + Sync,
{
    match request {
        // handled by the caller, it needs the head-check timer
        BackendRequest::Refresh => {}
        BackendRequest::TransactionCount(reply) => {
            let nonce = {
                let wallet_guard = wallet.read().await;
                wallet_guard
                    .account_state()
                    .map_err(SyncError::WalletError)?
                    .map(|state| state.nonce)
            };
            let _ignore_error = reply.send(nonce.ok_or(RequestError::NotReady));
        }
        BackendRequest::SendRawTransaction(reply, encoded) => {
            match writer.send_transaction(&encoded).await {
                Ok(()) => {
                    let _ignore_error =
                        reply.send(Ok(Hash32::new(keccak256(&encoded))));
                }
                Err(error) => {
                    let _ignore_error = reply.send(Err(RequestError::Peer(
                        ProtocolError::Io(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            error.to_string(),
                        )),
                    )));
                    return Err(SyncError::ProtocolError(error));
                }
            }
        }
        BackendRequest::GasPrice(reply) => {
            let _ignore_error = reply.send(Err(RequestError::Unsupported("gasPrice")));
        }
        BackendRequest::Call(reply, _) => {
            let _ignore_error = reply.send(Err(RequestError::Unsupported("call")));
        }
        BackendRequest::EstimateGas(reply, _) => {
            let _ignore_error = reply.send(Err(RequestError::Unsupported("estimateGas")));
        }
        BackendRequest::GetLogs(reply, _) => {
            let _ignore_error = reply.send(Err(RequestError::Unsupported("getLogs")));
        }
    }

    Ok(())
}
