#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![doc = r#"
# Ember Sync

## Overview
Ember-sync is a rust-based sync engine library for wallets operating on
Ethereum-compatible networks and provides the following features:
- Account projection, maintains a locally durable view of one account's
  balance, nonce, chain height and transaction history behind a storage
  contract the consumer implements.
- Dual back-ends, the same engine runs against a JSON-RPC node paired with an
  Etherscan-style transaction index, or against a single devp2p/LES peer with
  header-chain and account-proof verification (SPV).
- Event-driven, the engine pushes chain height, sync status, balance and
  transaction events through a single ordered channel; request/response
  operations (send, call, estimate gas, logs) are answered per back-end
  capability.
- Stop and clear, the engine can be shut down at any point; in-flight
  operations fail with a cancellation error and the last acknowledged height
  is persisted.

## Terminology
- Chain height - highest block height of the best chain known to the remote.
- Wallet height - highest block height persisted by the wallet store.
- Asset - the native coin or an ERC-20 contract tracked for the account.
- Checkpoint - a compiled-in trusted block from which SPV header sync starts.
- Head - the highest verified header of the SPV header chain.

## Sync lifecycle
1. The consumer constructs a [`sync::SyncSource`] (API or SPV), shares its
   wallet store behind `Arc<RwLock<_>>` and calls [`sync::sync`].
2. The engine sets the shared sync mode to `Running`, spawns its transport
   task and begins the back-end loop.
3. Events are emitted in observation order; a chain-height event always
   precedes balance or transaction events derived from it.
4. Setting the sync mode to `Shutdown` stops the back-end: the transport is
   closed, nothing further is persisted beyond the last acknowledged height
   and the engine reports `NotSynced`.
"#]

pub mod client;
pub mod config;
#[cfg(test)]
pub(crate) mod mocks;
pub mod crypto;
pub mod error;
pub mod header;
pub mod keys;
pub mod p2p;
pub mod primitives;
pub mod rlp;
pub mod rlpx;
pub mod sync;
pub mod transaction;
pub mod trie;
pub mod wallet;

pub use sync::sync;

use header::Checkpoint;
use primitives::Hash32;

// devp2p Hello client identifier
pub(crate) fn client_id() -> String {
    format!("ember-sync/{}", env!("CARGO_PKG_VERSION"))
}

/// Consensus parameters of an Ethereum-compatible network.
///
/// Implemented by the consumer's chain type; the engine only reads from it.
pub trait ChainParameters {
    /// EIP-155 chain id mixed into transaction signatures.
    fn chain_id(&self) -> u64;

    /// Network id exchanged in the LES status handshake.
    fn network_id(&self) -> u64;

    /// Genesis block hash. Peers advertising a different genesis are useless.
    fn genesis_hash(&self) -> Hash32;

    /// Trusted block from which SPV header sync starts.
    fn checkpoint(&self) -> Checkpoint;
}
