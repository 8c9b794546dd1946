//! `EmberConfig`
//! Chain parameters and endpoints for client construction.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use hex_literal::hex;
use num_bigint::BigUint;

use ember_sync::ChainParameters;
use ember_sync::config::SyncConfig;
use ember_sync::header::Checkpoint;
use ember_sync::primitives::Hash32;
use ember_sync::sync::SyncSource;

/// Default JSON-RPC node for mainnet.
pub const DEFAULT_MAINNET_RPC_SERVER: &str = "https://cloudflare-eth.com";
/// Default transaction index for mainnet.
pub const DEFAULT_MAINNET_INDEX_SERVER: &str = "https://api.etherscan.io/api";
/// Default JSON-RPC node for Ropsten.
pub const DEFAULT_ROPSTEN_RPC_SERVER: &str = "https://ropsten.infura.io/v3";
/// Default transaction index for Ropsten.
pub const DEFAULT_ROPSTEN_INDEX_SERVER: &str = "https://api-ropsten.etherscan.io/api";

const MAINNET_GENESIS: [u8; 32] =
    hex!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");
const ROPSTEN_GENESIS: [u8; 32] =
    hex!("41941023680923e0fe4d74a34bdac8141f2540e3ae90623718e47d66d1ca4a2d");
// Trusted Ropsten block the SPV header chain grows from.
const ROPSTEN_CHECKPOINT_NUMBER: u64 = 5_194_692;
const ROPSTEN_CHECKPOINT_HASH: [u8; 32] =
    hex!("195689d400000000000000000000000000000000000000000000000000006e8b");
const ROPSTEN_CHECKPOINT_TOTAL_DIFFICULTY: u64 = 18_529_791_467_262_594;
// Mainnet genesis difficulty, 0x400000000.
const MAINNET_GENESIS_DIFFICULTY: u64 = 17_179_869_184;

/// The networks an emberlib client can run against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainType {
    /// Mainnet
    Mainnet,
    /// Public testnet
    Ropsten,
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ChainType::{Mainnet, Ropsten};
        let name = match self {
            Mainnet => "main",
            Ropsten => "ropsten",
        };
        write!(f, "{name}")
    }
}

impl ChainParameters for ChainType {
    fn chain_id(&self) -> u64 {
        match self {
            Self::Mainnet => 1,
            Self::Ropsten => 3,
        }
    }

    fn network_id(&self) -> u64 {
        match self {
            Self::Mainnet => 1,
            Self::Ropsten => 3,
        }
    }

    fn genesis_hash(&self) -> Hash32 {
        match self {
            Self::Mainnet => Hash32::new(MAINNET_GENESIS),
            Self::Ropsten => Hash32::new(ROPSTEN_GENESIS),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        match self {
            // mainnet anchors on genesis, which any peer can serve from
            Self::Mainnet => Checkpoint {
                number: 0,
                hash: Hash32::new(MAINNET_GENESIS),
                total_difficulty: BigUint::from(MAINNET_GENESIS_DIFFICULTY),
            },
            Self::Ropsten => Checkpoint {
                number: ROPSTEN_CHECKPOINT_NUMBER,
                hash: Hash32::new(ROPSTEN_CHECKPOINT_HASH),
                total_difficulty: BigUint::from(ROPSTEN_CHECKPOINT_TOTAL_DIFFICULTY),
            },
        }
    }
}

/// An error determining a `ChainType` from a string.
#[derive(thiserror::Error, Debug)]
pub enum ChainFromStringError {
    /// of unknown chain,
    #[error("Invalid chain name '{0}'. Expected one of: mainnet, ropsten.")]
    UnknownChain(String),
}

/// Converts a chain name string to a `ChainType` variant.
pub fn chain_from_str(chain_name: &str) -> Result<ChainType, ChainFromStringError> {
    match chain_name {
        "mainnet" => Ok(ChainType::Mainnet),
        "ropsten" => Ok(ChainType::Ropsten),
        _ => Err(ChainFromStringError::UnknownChain(chain_name.to_string())),
    }
}

/// Gas limits applied by the fee estimator and the send path.
#[derive(Clone, Copy, Debug)]
pub struct GasSettings {
    /// Gas limit for plain value transfers.
    pub native_gas_limit: u64,
    /// Gas limit for ERC-20 transfers.
    pub erc20_gas_limit: u64,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            native_gas_limit: 21_000,
            erc20_gas_limit: 100_000,
        }
    }
}

/// Configuration for [`crate::client::EthereumClient`] construction.
#[derive(Clone, Debug)]
pub struct EmberConfig {
    /// The target chain.
    pub chain: ChainType,
    /// JSON-RPC node endpoint.
    pub rpc_uri: Arc<RwLock<http::Uri>>,
    /// Transaction index endpoint.
    pub index_uri: Arc<RwLock<http::Uri>>,
    /// Transaction index API key.
    pub index_api_key: Option<String>,
    /// An LES peer to sync from instead of the HTTP pair.
    pub spv_peer: Option<SpvPeer>,
    /// Gas limits for fee estimation.
    pub gas: GasSettings,
    /// Sync engine tuning.
    pub sync_config: SyncConfig,
}

/// A dialable LES peer.
#[derive(Clone, Debug)]
pub struct SpvPeer {
    /// Peer socket address.
    pub address: SocketAddr,
    /// Peer static public key.
    pub remote_public: secp256k1::PublicKey,
}

impl EmberConfig {
    /// Begins building a config for the given chain.
    #[must_use]
    pub fn build(chain: ChainType) -> EmberConfigBuilder {
        EmberConfigBuilder {
            chain,
            rpc_uri: None,
            index_uri: None,
            index_api_key: None,
            spv_peer: None,
            gas: GasSettings::default(),
            sync_config: SyncConfig::default(),
        }
    }

    /// The sync source the configuration selects: the SPV peer when one is
    /// configured, the HTTP pair otherwise.
    #[must_use]
    pub fn sync_source(&self) -> SyncSource {
        match &self.spv_peer {
            Some(peer) => SyncSource::Spv {
                address: peer.address,
                remote_public: peer.remote_public,
            },
            None => SyncSource::Api {
                rpc_url: self.rpc_uri.read().expect("rpc uri lock poisoned").clone(),
                index_url: self.index_uri.read().expect("index uri lock poisoned").clone(),
                api_key: self.index_api_key.clone(),
            },
        }
    }

    /// Returns the configured JSON-RPC endpoint.
    #[must_use]
    pub fn get_rpc_uri(&self) -> http::Uri {
        self.rpc_uri.read().expect("rpc uri lock poisoned").clone()
    }

    /// Replaces the JSON-RPC endpoint. Takes effect on the next start.
    pub fn set_rpc_uri(&self, uri: http::Uri) {
        *self.rpc_uri.write().expect("rpc uri lock poisoned") = uri;
    }
}

/// Builder for [`EmberConfig`].
#[derive(Clone, Debug)]
pub struct EmberConfigBuilder {
    chain: ChainType,
    rpc_uri: Option<http::Uri>,
    index_uri: Option<http::Uri>,
    index_api_key: Option<String>,
    spv_peer: Option<SpvPeer>,
    gas: GasSettings,
    sync_config: SyncConfig,
}

impl EmberConfigBuilder {
    /// Sets the JSON-RPC endpoint.
    #[must_use]
    pub fn set_rpc_uri(mut self, uri: http::Uri) -> Self {
        self.rpc_uri = Some(uri);
        self
    }

    /// Sets the transaction index endpoint.
    #[must_use]
    pub fn set_index_uri(mut self, uri: http::Uri) -> Self {
        self.index_uri = Some(uri);
        self
    }

    /// Sets the transaction index API key.
    #[must_use]
    pub fn set_index_api_key(mut self, api_key: String) -> Self {
        self.index_api_key = Some(api_key);
        self
    }

    /// Selects SPV sync from the given peer.
    #[must_use]
    pub fn set_spv_peer(mut self, peer: SpvPeer) -> Self {
        self.spv_peer = Some(peer);
        self
    }

    /// Overrides the gas table.
    #[must_use]
    pub fn set_gas(mut self, gas: GasSettings) -> Self {
        self.gas = gas;
        self
    }

    /// Overrides sync engine tuning.
    #[must_use]
    pub fn set_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Finalises the configuration, filling unset endpoints with the chain
    /// defaults.
    #[must_use]
    pub fn create(self) -> EmberConfig {
        let (default_rpc, default_index) = match self.chain {
            ChainType::Mainnet => (DEFAULT_MAINNET_RPC_SERVER, DEFAULT_MAINNET_INDEX_SERVER),
            ChainType::Ropsten => (DEFAULT_ROPSTEN_RPC_SERVER, DEFAULT_ROPSTEN_INDEX_SERVER),
        };

        EmberConfig {
            chain: self.chain,
            rpc_uri: Arc::new(RwLock::new(self.rpc_uri.unwrap_or_else(|| {
                default_rpc.parse().expect("default rpc uri parses")
            }))),
            index_uri: Arc::new(RwLock::new(self.index_uri.unwrap_or_else(|| {
                default_index.parse().expect("default index uri parses")
            }))),
            index_api_key: self.index_api_key,
            spv_peer: self.spv_peer,
            gas: self.gas,
            sync_config: self.sync_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_sync::ChainParameters;

    use super::{ChainType, EmberConfig, chain_from_str};

    #[test]
    fn chain_identifiers() {
        assert_eq!(ChainType::Mainnet.chain_id(), 1);
        assert_eq!(ChainType::Ropsten.chain_id(), 3);
        assert_eq!(
            ChainType::Ropsten.genesis_hash().to_string(),
            "0x41941023680923e0fe4d74a34bdac8141f2540e3ae90623718e47d66d1ca4a2d"
        );
    }

    #[test]
    fn ropsten_checkpoint_is_compiled_in() {
        let checkpoint = ChainType::Ropsten.checkpoint();
        assert_eq!(checkpoint.number, 5_194_692);
        assert_eq!(
            checkpoint.total_difficulty,
            num_bigint::BigUint::from(18_529_791_467_262_594u64)
        );
    }

    #[test]
    fn builder_falls_back_to_chain_defaults() {
        let config = EmberConfig::build(ChainType::Ropsten).create();
        assert!(
            config
                .get_rpc_uri()
                .to_string()
                .starts_with("https://ropsten")
        );
        assert_eq!(config.gas.native_gas_limit, 21_000);
    }

    #[test]
    fn chain_parses_from_name() {
        assert_eq!(chain_from_str("mainnet").unwrap(), ChainType::Mainnet);
        assert!(chain_from_str("regtest").is_err());
    }
}
