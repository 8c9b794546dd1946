//! Module for handling all connections to the JSON-RPC node and the
//! transaction index.

use num_bigint::BigUint;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::error::ServerError;
use crate::primitives::{Address, Hash32};
use crate::transaction::Transaction;
use crate::wallet::Asset;

pub mod fetch;

/// A contract call or gas estimation request.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    /// Sender, omitted for plain reads.
    pub from: Option<Address>,
    /// Target contract.
    pub to: Address,
    /// Transferred value in wei, omitted for plain reads.
    pub value: Option<BigUint>,
    /// ABI-encoded call data.
    pub data: Vec<u8>,
}

/// An `eth_getLogs` filter.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// First block of the queried range.
    pub from_block: u64,
    /// Last block of the queried range, `latest` when absent.
    pub to_block: Option<u64>,
    /// Restrict to logs emitted by this contract.
    pub address: Option<Address>,
    /// Topic filters, position-matched.
    pub topics: Vec<Hash32>,
}

/// A log entry returned by `eth_getLogs`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics.
    pub topics: Vec<Hash32>,
    /// Unindexed data.
    pub data: Vec<u8>,
    /// Containing block.
    pub block_height: u64,
    /// Containing transaction.
    pub transaction_hash: Hash32,
}

/// One page request against the Etherscan-style transaction index.
#[derive(Debug, Clone)]
pub struct TransactionPageRequest {
    /// Account the index is queried for.
    pub address: Address,
    /// First block of interest.
    pub start_block: u64,
    /// 1-based page number.
    pub page: u64,
    /// Records per page.
    pub offset: u64,
    /// Which index to page: `txlist` for native, `tokentx` for a token.
    pub asset: Asset,
}

/// Fetch requests are created and sent to the [`crate::client::fetch::fetch`]
/// task when a connection to the remote is required.
///
/// Each variant includes a [`tokio::sync::oneshot::Sender`] for returning the
/// fetched data to the requester.
#[derive(Debug)]
pub enum FetchRequest {
    /// Gets the height of the blockchain from the node.
    BlockNumber(oneshot::Sender<Result<u64, ServerError>>),
    /// Gets the latest native balance of an address.
    Balance(oneshot::Sender<Result<BigUint, ServerError>>, Address),
    /// Gets the pending transaction count of an address.
    TransactionCount(oneshot::Sender<Result<u64, ServerError>>, Address),
    /// Gets the node's gas price suggestion.
    GasPrice(oneshot::Sender<Result<u64, ServerError>>),
    /// Broadcasts a signed transaction, returning its hash.
    SendRawTransaction(oneshot::Sender<Result<Hash32, ServerError>>, Vec<u8>),
    /// Executes a read-only contract call.
    Call(oneshot::Sender<Result<Vec<u8>, ServerError>>, CallRequest),
    /// Estimates the gas a call would consume.
    EstimateGas(oneshot::Sender<Result<u64, ServerError>>, CallRequest),
    /// Fetches log entries matching a filter.
    GetLogs(oneshot::Sender<Result<Vec<LogEntry>, ServerError>>, LogFilter),
    /// Gets an ERC-20 balance via `balanceOf` `eth_call`: `(contract, owner)`.
    Erc20Balance(
        oneshot::Sender<Result<BigUint, ServerError>>,
        (Address, Address),
    ),
    /// Gets one page of the historical transaction index.
    TransactionPage(
        oneshot::Sender<Result<Vec<Transaction>, ServerError>>,
        TransactionPageRequest,
    ),
}

/// Gets the height of the blockchain from the node.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub(crate) async fn get_block_number(
    fetch_request_sender: UnboundedSender<FetchRequest>,
) -> Result<u64, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::BlockNumber(reply_sender))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Gets the latest native balance of `address`.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub(crate) async fn get_balance(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    address: Address,
) -> Result<BigUint, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Balance(reply_sender, address))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Gets the pending transaction count of `address` for nonce assignment.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub(crate) async fn get_transaction_count(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    address: Address,
) -> Result<u64, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::TransactionCount(reply_sender, address))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Gets the node's gas price suggestion in wei.
pub(crate) async fn get_gas_price(
    fetch_request_sender: UnboundedSender<FetchRequest>,
) -> Result<u64, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::GasPrice(reply_sender))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Broadcasts a signed transaction.
pub(crate) async fn send_raw_transaction(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    encoded: Vec<u8>,
) -> Result<Hash32, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::SendRawTransaction(reply_sender, encoded))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Executes a read-only contract call.
pub(crate) async fn call(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    request: CallRequest,
) -> Result<Vec<u8>, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Call(reply_sender, request))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Estimates gas for a call.
pub(crate) async fn estimate_gas(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    request: CallRequest,
) -> Result<u64, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::EstimateGas(reply_sender, request))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Fetches log entries matching `filter`.
pub(crate) async fn get_logs(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    filter: LogFilter,
) -> Result<Vec<LogEntry>, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::GetLogs(reply_sender, filter))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Gets the ERC-20 balance of `owner` at `contract`.
pub(crate) async fn get_erc20_balance(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    contract: Address,
    owner: Address,
) -> Result<BigUint, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Erc20Balance(reply_sender, (contract, owner)))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}

/// Gets one page of the historical transaction index.
pub(crate) async fn get_transaction_page(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    request: TransactionPageRequest,
) -> Result<Vec<Transaction>, ServerError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::TransactionPage(reply_sender, request))
        .map_err(|_| ServerError::FetcherDropped)?;

    reply_receiver.await.map_err(|_| ServerError::FetcherDropped)?
}
