//! Error types for [`crate::wallet::EthereumWallet`].

/// Errors raised by the in-memory wallet store.
///
/// The map-backed store cannot fail; the type exists to satisfy the storage
/// contract and to give persistence-backed stores a place to grow into.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {}
