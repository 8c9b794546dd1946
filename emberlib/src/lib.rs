#![allow(missing_docs)]
#![forbid(unsafe_code)]
//! `EmberLib`
//! Ember wallet kit library
//!
//! Maintains an authoritative local view of one Ethereum account (balance,
//! nonce, chain height, transactions) over either a JSON-RPC/index back-end
//! or a verified LES peer, and signs and broadcasts value transfers,
//! contract calls and Uniswap V2 swaps.

pub mod client;
pub mod config;
pub mod uniswap;
pub mod utils;
pub mod wallet;
