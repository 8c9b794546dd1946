//! The LES/2 message set, carried at the negotiated capability offset.

use num_bigint::BigUint;

use crate::error::ProtocolError;
use crate::header::BlockHeader;
use crate::primitives::{Address, Hash32};
use crate::rlp;

/// Status, relative to the capability offset.
pub const STATUS: u64 = 0x00;
/// GetBlockHeaders, relative to the capability offset.
pub const GET_BLOCK_HEADERS: u64 = 0x02;
/// BlockHeaders, relative to the capability offset.
pub const BLOCK_HEADERS: u64 = 0x03;
/// GetProofs, relative to the capability offset.
pub const GET_PROOFS: u64 = 0x08;
/// Proofs, relative to the capability offset.
pub const PROOFS: u64 = 0x09;
/// SendTx, relative to the capability offset.
pub const SEND_TX: u64 = 0x0c;

/// The LES status announcement, a key/value list.
///
/// Request ids are mirrored by the responding peer on every other message;
/// Status itself carries none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LesStatus {
    /// LES protocol version.
    pub protocol_version: u64,
    /// Network id, must match ours.
    pub network_id: u64,
    /// Total difficulty at the announced head.
    pub head_total_difficulty: BigUint,
    /// Hash of the announced head.
    pub head_hash: Hash32,
    /// Number of the announced head.
    pub head_number: u64,
    /// Genesis hash, must match ours.
    pub genesis_hash: Hash32,
    /// Peer serves headers.
    pub serve_headers: bool,
    /// Peer serves chain data from this block on.
    pub serve_chain_since: Option<u64>,
    /// Peer serves state from this block on.
    pub serve_state_since: Option<u64>,
    /// Peer relays transactions.
    pub tx_relay: bool,
}

impl LesStatus {
    /// Encodes the announcement.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut pairs = Vec::new();
        let mut pair = |key: &str, value: Vec<u8>| {
            let mut payload = rlp::encode_bytes(key.as_bytes());
            payload.extend(value);
            pairs.extend(rlp::encode_list(payload));
        };
        pair("protocolVersion", rlp::encode_u64(self.protocol_version));
        pair("networkId", rlp::encode_u64(self.network_id));
        pair("headTd", rlp::encode_biguint(&self.head_total_difficulty));
        pair("headHash", rlp::encode_bytes(self.head_hash.as_bytes()));
        pair("headNum", rlp::encode_u64(self.head_number));
        pair("genesisHash", rlp::encode_bytes(self.genesis_hash.as_bytes()));
        if self.serve_headers {
            pair("serveHeaders", rlp::encode_bytes(&[]));
        }
        if let Some(since) = self.serve_chain_since {
            pair("serveChainSince", rlp::encode_u64(since));
        }
        if let Some(since) = self.serve_state_since {
            pair("serveStateSince", rlp::encode_u64(since));
        }
        if self.tx_relay {
            pair("txRelay", rlp::encode_bytes(&[]));
        }

        rlp::encode_list(pairs)
    }

    /// Decodes an announcement, ignoring unknown keys (flow control and
    /// friends).
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (item, _) = rlp::decode_item(data)?;

        let mut protocol_version = None;
        let mut network_id = None;
        let mut head_total_difficulty = None;
        let mut head_hash = None;
        let mut head_number = None;
        let mut genesis_hash = None;
        let mut serve_headers = false;
        let mut serve_chain_since = None;
        let mut serve_state_since = None;
        let mut tx_relay = false;

        for pair in item.as_list()? {
            let pair = pair.as_list()?;
            if pair.len() < 2 {
                continue;
            }
            match std::str::from_utf8(pair[0].as_bytes()?).unwrap_or_default() {
                "protocolVersion" => protocol_version = Some(pair[1].as_u64()?),
                "networkId" => network_id = Some(pair[1].as_u64()?),
                "headTd" => head_total_difficulty = Some(pair[1].as_biguint()?),
                "headHash" => head_hash = Some(Hash32::new(pair[1].as_array()?)),
                "headNum" => head_number = Some(pair[1].as_u64()?),
                "genesisHash" => genesis_hash = Some(Hash32::new(pair[1].as_array()?)),
                "serveHeaders" => serve_headers = true,
                "serveChainSince" => serve_chain_since = Some(pair[1].as_u64()?),
                "serveStateSince" => serve_state_since = Some(pair[1].as_u64()?),
                "txRelay" => tx_relay = true,
                _ => {}
            }
        }

        Ok(Self {
            protocol_version: protocol_version
                .ok_or(ProtocolError::MissingStatusKey("protocolVersion"))?,
            network_id: network_id.ok_or(ProtocolError::MissingStatusKey("networkId"))?,
            head_total_difficulty: head_total_difficulty
                .ok_or(ProtocolError::MissingStatusKey("headTd"))?,
            head_hash: head_hash.ok_or(ProtocolError::MissingStatusKey("headHash"))?,
            head_number: head_number.ok_or(ProtocolError::MissingStatusKey("headNum"))?,
            genesis_hash: genesis_hash.ok_or(ProtocolError::MissingStatusKey("genesisHash"))?,
            serve_headers,
            serve_chain_since,
            serve_state_since,
            tx_relay,
        })
    }
}

/// A pipelined header request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    /// Request id, mirrored by the response.
    pub request_id: u64,
    /// First block number of interest.
    pub origin: u64,
    /// Maximum number of headers to return.
    pub amount: u64,
    /// Blocks to skip between consecutive headers.
    pub skip: u64,
    /// Walk the chain backwards.
    pub reverse: bool,
}

impl GetBlockHeaders {
    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut query = Vec::new();
        query.extend(rlp::encode_u64(self.origin));
        query.extend(rlp::encode_u64(self.amount));
        query.extend(rlp::encode_u64(self.skip));
        query.extend(rlp::encode_u64(u64::from(self.reverse)));

        let mut payload = rlp::encode_u64(self.request_id);
        payload.extend(rlp::encode_list(query));

        rlp::encode_list(payload)
    }
}

/// A batch of headers answering one request.
#[derive(Debug, Clone)]
pub struct BlockHeaders {
    /// Mirrored request id.
    pub request_id: u64,
    /// Flow-control buffer value reported by the server.
    pub buffer_value: u64,
    /// The headers, in request order.
    pub headers: Vec<BlockHeader>,
}

impl BlockHeaders {
    /// Decodes a response.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (item, _) = rlp::decode_item(data)?;
        let fields = item.as_list()?;
        if fields.len() < 3 {
            return Err(ProtocolError::Rlp(rlp::RlpError::UnexpectedKind));
        }

        let headers = fields[2]
            .as_list()?
            .iter()
            .map(BlockHeader::from_rlp)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            request_id: fields[0].as_u64()?,
            buffer_value: fields[1].as_u64()?,
            headers,
        })
    }
}

/// An account proof request at a specific block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetProofs {
    /// Request id, mirrored by the response.
    pub request_id: u64,
    /// Block whose state root anchors the proof.
    pub block_hash: Hash32,
    /// Account the proof is requested for.
    pub address: Address,
}

impl GetProofs {
    /// Encodes the request with an empty storage key.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut request = Vec::new();
        request.extend(rlp::encode_bytes(self.block_hash.as_bytes()));
        request.extend(rlp::encode_bytes(self.address.as_bytes()));
        request.extend(rlp::encode_bytes(&[]));
        request.extend(rlp::encode_u64(0));

        let mut payload = rlp::encode_u64(self.request_id);
        payload.extend(rlp::encode_list(rlp::encode_list(request)));

        rlp::encode_list(payload)
    }
}

/// The Merkle-Patricia nodes answering one proof request.
#[derive(Debug, Clone)]
pub struct Proofs {
    /// Mirrored request id.
    pub request_id: u64,
    /// Flow-control buffer value reported by the server.
    pub buffer_value: u64,
    /// Proof nodes, re-encoded canonically for hashing.
    pub nodes: Vec<Vec<u8>>,
}

impl Proofs {
    /// Decodes a response.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (item, _) = rlp::decode_item(data)?;
        let fields = item.as_list()?;
        if fields.len() < 3 {
            return Err(ProtocolError::Rlp(rlp::RlpError::UnexpectedKind));
        }

        Ok(Self {
            request_id: fields[0].as_u64()?,
            buffer_value: fields[1].as_u64()?,
            nodes: fields[2].as_list()?.iter().map(rlp::Item::encode).collect(),
        })
    }
}

/// Encodes a SendTx payload carrying one signed transaction.
#[must_use]
pub fn encode_send_tx(encoded_transaction: &[u8]) -> Vec<u8> {
    rlp::encode_list(encoded_transaction.to_vec())
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use crate::header::tests::child_header;
    use crate::primitives::{Address, Hash32};
    use crate::rlp;

    use super::{BlockHeaders, GetBlockHeaders, GetProofs, LesStatus};

    fn status() -> LesStatus {
        LesStatus {
            protocol_version: 2,
            network_id: 3,
            head_total_difficulty: BigUint::from(18_529_791_467_262_594u64),
            head_hash: Hash32::new([0xab; 32]),
            head_number: 5_200_000,
            genesis_hash: Hash32::new([0xcd; 32]),
            serve_headers: true,
            serve_chain_since: Some(0),
            serve_state_since: Some(5_000_000),
            tx_relay: true,
        }
    }

    #[test]
    fn status_round_trip() {
        let status = status();
        assert_eq!(LesStatus::decode(&status.encode()).unwrap(), status);
    }

    #[test]
    fn status_requires_genesis() {
        let mut pairs = Vec::new();
        let mut payload = rlp::encode_bytes(b"protocolVersion");
        payload.extend(rlp::encode_u64(2));
        pairs.extend(rlp::encode_list(payload));
        let encoded = rlp::encode_list(pairs);

        assert!(LesStatus::decode(&encoded).is_err());
    }

    #[test]
    fn get_block_headers_layout() {
        let request = GetBlockHeaders {
            request_id: 7,
            origin: 5_194_693,
            amount: 192,
            skip: 0,
            reverse: false,
        };
        let decoded = rlp::decode(&request.encode()).unwrap();
        let fields = decoded.as_list().unwrap();
        assert_eq!(fields[0].as_u64().unwrap(), 7);
        let query = fields[1].as_list().unwrap();
        assert_eq!(query[0].as_u64().unwrap(), 5_194_693);
        assert_eq!(query[1].as_u64().unwrap(), 192);
        assert_eq!(query[3].as_u64().unwrap(), 0);
    }

    #[test]
    fn block_headers_round_trip() {
        let headers = vec![
            child_header(Hash32::new([0; 32]), 1),
            child_header(Hash32::new([1; 32]), 2),
        ];
        let mut list = Vec::new();
        for header in &headers {
            list.extend(header.encoded());
        }
        let mut payload = rlp::encode_u64(7);
        payload.extend(rlp::encode_u64(1000));
        payload.extend(rlp::encode_list(list));
        let encoded = rlp::encode_list(payload);

        let decoded = BlockHeaders::decode(&encoded).unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.buffer_value, 1000);
        assert_eq!(decoded.headers.len(), 2);
        assert_eq!(decoded.headers[0].hash, headers[0].hash);
    }

    #[test]
    fn get_proofs_layout() {
        let request = GetProofs {
            request_id: 9,
            block_hash: Hash32::new([0xee; 32]),
            address: Address::new([0x11; 20]),
        };
        let decoded = rlp::decode(&request.encode()).unwrap();
        let fields = decoded.as_list().unwrap();
        assert_eq!(fields[0].as_u64().unwrap(), 9);
        let requests = fields[1].as_list().unwrap();
        let entry = requests[0].as_list().unwrap();
        assert_eq!(entry[0].as_bytes().unwrap(), &[0xee; 32]);
        assert_eq!(entry[1].as_bytes().unwrap(), &[0x11; 20]);
        assert!(entry[2].as_bytes().unwrap().is_empty());
    }
}
