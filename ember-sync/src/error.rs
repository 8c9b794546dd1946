//! Ember sync error module.
//!
//! The split follows how each failure is handled: server errors are retried
//! with backoff, protocol errors disconnect the peer, state errors reset the
//! current sync cycle, request errors fail fast to the caller.

use crate::crypto::CryptoError;
use crate::p2p::DisconnectReason;
use crate::primitives::Hash32;
use crate::rlp::RlpError;
use crate::trie::ProofError;

/// Top level error enumerating any error that may occur during sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    /// Server error.
    #[error("server error. {0}")]
    ServerError(#[from] ServerError),
    /// Protocol error.
    #[error("protocol error. {0}")]
    ProtocolError(#[from] ProtocolError),
    /// State error.
    #[error("state error. {0}")]
    StateError(#[from] StateError),
    /// Sync mode error.
    #[error("sync mode error. {0}")]
    SyncModeError(#[from] SyncModeError),
    /// Wallet error.
    #[error("wallet error. {0}")]
    WalletError(E),
}

/// Server errors.
///
/// Errors associated with reaching the remote and receiving invalid data.
/// Transient variants are retried with capped exponential backoff.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// HTTP transport failed.
    #[error("server request failed. {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// The JSON-RPC endpoint returned an error object.
    #[error("rpc error {code}. {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// Response did not match the expected shape.
    #[error("server returned invalid response. {0}")]
    InvalidResponse(String),
    /// The transaction index rejected the configured API key.
    ///
    /// Not retried; sync stops with `NotSynced` until reconfigured.
    #[error("transaction index rejected the API key")]
    InvalidApiKey,
    /// Fetcher task was dropped.
    #[error("fetcher task was dropped.")]
    FetcherDropped,
}

impl ServerError {
    /// Whether the polling loop should retry with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidApiKey)
    }
}

/// Protocol errors.
///
/// The peer violated the wire protocol; the connection is torn down and
/// re-established after backoff.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Peer socket failed.
    #[error("peer connection error. {0}")]
    Io(#[from] std::io::Error),
    /// Peer sent malformed RLP.
    #[error("malformed RLP from peer. {0}")]
    Rlp(#[from] RlpError),
    /// Handshake cryptography failed.
    #[error("handshake error. {0}")]
    Crypto(#[from] CryptoError),
    /// Frame MAC mismatch. The rolling MACs are now desynchronised and the
    /// session cannot be recovered.
    #[error("frame MAC mismatch")]
    BadMac,
    /// Frame advertises a payload larger than the protocol allows.
    #[error("oversized frame. {0} bytes")]
    OversizedFrame(usize),
    /// Peer sent a message code we did not expect in the current state.
    #[error("unexpected message code {0:#x}")]
    UnexpectedMessage(u64),
    /// Capability intersection came up empty.
    #[error("peer does not serve les/2")]
    NoSharedCapability,
    /// Peer status announcement is missing a required key.
    #[error("peer status is missing {0}")]
    MissingStatusKey(&'static str),
    /// Peer is on a different chain.
    #[error("genesis mismatch. ours {ours}, peer {peers}")]
    WrongGenesis {
        /// Our genesis hash.
        ours: Hash32,
        /// The peer's genesis hash.
        peers: Hash32,
    },
    /// Peer is on a different network.
    #[error("network id mismatch. ours {ours}, peer {peers}")]
    WrongNetwork {
        /// Our network id.
        ours: u64,
        /// The peer's network id.
        peers: u64,
    },
    /// Header batch failed continuity verification.
    #[error("header continuity error. {0}")]
    Continuity(#[from] ContinuityError),
    /// Peer asked to disconnect.
    #[error("peer disconnected. {0}")]
    Disconnected(DisconnectReason),
    /// Peer did not answer a ping within the deadline.
    #[error("ping timed out")]
    PongTimeout,
    /// Peer task was dropped while a request was in flight.
    #[error("peer task was dropped.")]
    PeerDropped,
}

/// Block continuity errors.
#[derive(Debug, thiserror::Error)]
pub enum ContinuityError {
    /// Height discontinuity.
    #[error(
        "height discontinuity. header with height {height} where {expected_height} was expected"
    )]
    HeightDiscontinuity {
        /// Header height.
        height: u64,
        /// Expected height.
        expected_height: u64,
    },
    /// Hash discontinuity.
    #[error(
        "hash discontinuity. header at height {height} has parent {parent_hash} but the previous header hashes to {previous_hash}"
    )]
    HashDiscontinuity {
        /// Header height.
        height: u64,
        /// Header's parent hash field.
        parent_hash: Hash32,
        /// Actual previous header hash.
        previous_hash: Hash32,
    },
}

/// State errors.
///
/// The local projection is inconsistent; fatal to the current sync cycle.
/// The back-end resets to the checkpoint and restarts.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Account proof does not verify against the head state root.
    #[error("account proof failed. {0}")]
    Proof(#[from] ProofError),
    /// The header store lost the head the sync cycle was anchored on.
    #[error("head header missing from store")]
    HeadMissing,
}

/// Sync mode error.
#[derive(Debug, thiserror::Error)]
pub enum SyncModeError {
    /// Invalid sync mode.
    #[error("invalid sync mode. {0}")]
    InvalidSyncMode(u8),
    /// Sync is already running.
    #[error("sync is already running")]
    SyncAlreadyRunning,
    /// Sync is not running.
    #[error("sync is not running")]
    SyncNotRunning,
}

/// Errors returned by per-operation requests (`send`, `call`, …).
///
/// These fail fast; nothing here is retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The remote rejected or failed the operation.
    #[error("server error. {0}")]
    Server(#[from] ServerError),
    /// The peer connection failed the operation.
    #[error("peer error. {0}")]
    Peer(#[from] ProtocolError),
    /// The operation is not available on the active back-end.
    #[error("operation {0} is not supported by the active back-end")]
    Unsupported(&'static str),
    /// The back-end was stopped while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,
    /// The back-end has not yet learned the data the operation needs.
    #[error("account state not yet synced")]
    NotReady,
}
