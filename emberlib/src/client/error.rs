//! Error types for [`crate::client::EthereumClient`].

use ember_sync::error::{RequestError, SyncError, SyncModeError};
use ember_sync::keys::KeyError;
use ember_sync::primitives::AddressError;

use crate::wallet::error::WalletError;

/// Top level error for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Sync mode error.
    #[error("sync mode error. {0}")]
    SyncModeError(#[from] SyncModeError),
    /// A per-operation request failed or was cancelled.
    #[error("request error. {0}")]
    RequestError(#[from] RequestError),
    /// Key error.
    #[error("key error. {0}")]
    KeyError(#[from] KeyError),
    /// Address validation error.
    #[error("invalid address. {0}")]
    AddressError(#[from] AddressError),
    /// The sync task ended with an error.
    #[error("sync error. {0}")]
    SyncError(#[from] SyncError<WalletError>),
}
