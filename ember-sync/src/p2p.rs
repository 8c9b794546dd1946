//! devp2p base protocol: Hello, Disconnect, Ping, Pong and capability
//! negotiation.

use crate::error::ProtocolError;
use crate::rlp::{self, Item};

pub mod les;
pub mod peer;

/// devp2p base protocol version announced in Hello.
pub const BASE_PROTOCOL_VERSION: u64 = 5;

/// Message code of Hello.
pub const HELLO: u64 = 0x00;
/// Message code of Disconnect.
pub const DISCONNECT: u64 = 0x01;
/// Message code of Ping.
pub const PING: u64 = 0x02;
/// Message code of Pong.
pub const PONG: u64 = 0x03;
/// First message code available to the negotiated capability.
pub const CAPABILITY_OFFSET: u64 = 0x10;

/// A protocol the peer offers, ordered lexicographically by name then
/// version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Capability {
    /// Short protocol name, e.g. `les`.
    pub name: String,
    /// Protocol version.
    pub version: u8,
}

impl Capability {
    /// The light client capability this engine speaks.
    #[must_use]
    pub fn les2() -> Self {
        Self {
            name: "les".to_string(),
            version: 2,
        }
    }
}

/// The devp2p Hello message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Base protocol version.
    pub protocol_version: u64,
    /// Client identifier string.
    pub client_id: String,
    /// Offered capabilities.
    pub capabilities: Vec<Capability>,
    /// Advertised listen port, zero when not listening.
    pub listen_port: u64,
    /// The node's 64-byte public key.
    pub node_id: [u8; 64],
}

impl Hello {
    /// Encodes the message payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut capabilities = Vec::new();
        for capability in &self.capabilities {
            let mut pair = Vec::new();
            pair.extend(rlp::encode_bytes(capability.name.as_bytes()));
            pair.extend(rlp::encode_u64(u64::from(capability.version)));
            capabilities.extend(rlp::encode_list(pair));
        }

        let mut payload = Vec::new();
        payload.extend(rlp::encode_u64(self.protocol_version));
        payload.extend(rlp::encode_bytes(self.client_id.as_bytes()));
        payload.extend(rlp::encode_list(capabilities));
        payload.extend(rlp::encode_u64(self.listen_port));
        payload.extend(rlp::encode_bytes(&self.node_id));

        rlp::encode_list(payload)
    }

    /// Decodes a Hello payload.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (item, _) = rlp::decode_item(data)?;
        let fields = item.as_list()?;
        if fields.len() < 5 {
            return Err(ProtocolError::Rlp(rlp::RlpError::UnexpectedKind));
        }

        let mut capabilities = Vec::new();
        for pair in fields[2].as_list()? {
            let pair = pair.as_list()?;
            if pair.len() < 2 {
                return Err(ProtocolError::Rlp(rlp::RlpError::UnexpectedKind));
            }
            capabilities.push(Capability {
                name: String::from_utf8_lossy(pair[0].as_bytes()?).into_owned(),
                version: pair[1].as_u64()? as u8,
            });
        }

        Ok(Self {
            protocol_version: fields[0].as_u64()?,
            client_id: String::from_utf8_lossy(fields[1].as_bytes()?).into_owned(),
            capabilities,
            listen_port: fields[3].as_u64()?,
            node_id: fields[4].as_array()?,
        })
    }

    /// Whether the peer shares a capability with us.
    #[must_use]
    pub fn supports(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Disconnect reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Disconnect requested.
    Requested,
    /// TCP subsystem error.
    TcpError,
    /// Breach of protocol.
    BadProtocol,
    /// Useless peer.
    UselessPeer,
    /// Too many peers.
    TooManyPeers,
    /// Already connected.
    AlreadyConnected,
    /// Incompatible p2p protocol version.
    IncompatibleP2p,
    /// Null node identity received.
    NullNodeId,
    /// Client quitting.
    ClientQuit,
    /// Timed out.
    TimeOut,
    /// Some other reason.
    Other,
    /// A code outside the table.
    Unknown(u8),
}

impl DisconnectReason {
    /// The wire code.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Requested => 0x00,
            Self::TcpError => 0x01,
            Self::BadProtocol => 0x02,
            Self::UselessPeer => 0x03,
            Self::TooManyPeers => 0x04,
            Self::AlreadyConnected => 0x05,
            Self::IncompatibleP2p => 0x06,
            Self::NullNodeId => 0x07,
            Self::ClientQuit => 0x08,
            Self::TimeOut => 0x0a,
            Self::Other => 0x10,
            Self::Unknown(code) => *code,
        }
    }

    /// Maps a wire code back to a reason.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Requested,
            0x01 => Self::TcpError,
            0x02 => Self::BadProtocol,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleP2p,
            0x07 => Self::NullNodeId,
            0x08 => Self::ClientQuit,
            0x0a => Self::TimeOut,
            0x10 => Self::Other,
            code => Self::Unknown(code),
        }
    }

    /// Encodes a Disconnect payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode_list(rlp::encode_u64(u64::from(self.code())))
    }

    /// Decodes a Disconnect payload. Some peers send the bare reason without
    /// the list wrapper.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (item, _) = rlp::decode_item(data)?;
        let code = match &item {
            Item::List(items) if !items.is_empty() => items[0].as_u64()?,
            Item::List(_) => u64::from(Self::Requested.code()),
            Item::Bytes(_) => item.as_u64()?,
        };

        Ok(Self::from_code(code as u8))
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Requested => "disconnect requested",
            Self::TcpError => "TCP subsystem error",
            Self::BadProtocol => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleP2p => "incompatible p2p protocol version",
            Self::NullNodeId => "null node identity",
            Self::ClientQuit => "client quitting",
            Self::TimeOut => "timed out",
            Self::Other => "other reason",
            Self::Unknown(code) => return write!(f, "unknown reason {code:#x}"),
        };
        write!(f, "{reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, DisconnectReason, Hello};

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            protocol_version: 5,
            client_id: "emberlib/0.2.0".to_string(),
            capabilities: vec![Capability::les2()],
            listen_port: 0,
            node_id: [0x42; 64],
        };
        let decoded = Hello::decode(&hello.encode()).unwrap();
        assert_eq!(decoded, hello);
        assert!(decoded.supports(&Capability::les2()));
        assert!(!decoded.supports(&Capability {
            name: "eth".to_string(),
            version: 63,
        }));
    }

    #[test]
    fn disconnect_reason_codes() {
        for reason in [
            DisconnectReason::Requested,
            DisconnectReason::BadProtocol,
            DisconnectReason::UselessPeer,
            DisconnectReason::TimeOut,
            DisconnectReason::Other,
        ] {
            assert_eq!(DisconnectReason::from_code(reason.code()), reason);
            assert_eq!(DisconnectReason::decode(&reason.encode()).unwrap(), reason);
        }
        assert_eq!(
            DisconnectReason::from_code(0x0b),
            DisconnectReason::Unknown(0x0b)
        );
    }

    #[test]
    fn disconnect_tolerates_bare_reason() {
        // 0x03 as a bare single byte
        assert_eq!(
            DisconnectReason::decode(&[0x03]).unwrap(),
            DisconnectReason::UselessPeer
        );
    }

    #[test]
    fn capabilities_order_by_name_then_version() {
        let mut capabilities = vec![
            Capability {
                name: "les".to_string(),
                version: 2,
            },
            Capability {
                name: "eth".to_string(),
                version: 63,
            },
            Capability {
                name: "les".to_string(),
                version: 1,
            },
        ];
        capabilities.sort();
        assert_eq!(capabilities[0].name, "eth");
        assert_eq!((capabilities[1].version, capabilities[2].version), (1, 2));
    }
}
