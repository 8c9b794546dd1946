//! A single devp2p/LES peer connection.
//!
//! `Connecting → AuthSent → AuthAckReceived → HelloExchange → StatusExchange
//! → Ready → Disconnected`. The connection is owned by one task; frame reads
//! and writes are never interleaved within a direction.

use std::net::SocketAddr;
use std::time::Duration;

use num_bigint::BigUint;
use secp256k1::{PublicKey, SecretKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ProtocolError;
use crate::p2p::les::{self, GetBlockHeaders, GetProofs, LesStatus};
use crate::p2p::{
    BASE_PROTOCOL_VERSION, CAPABILITY_OFFSET, Capability, DISCONNECT, DisconnectReason, HELLO,
    Hello, PING, PONG,
};
use crate::primitives::{Address, Hash32};
use crate::rlpx::{FrameCodec, handshake};

/// Idle time before a Ping is sent.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
/// Deadline for the answering Pong.
pub const PONG_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for each handshake round trip.
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(10);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP connect in progress.
    Connecting,
    /// Auth sent, awaiting ack.
    AuthSent,
    /// Ack parsed, secrets derived.
    AuthAckReceived,
    /// Hello sent, awaiting peer Hello.
    HelloExchange,
    /// LES Status sent, awaiting peer Status.
    StatusExchange,
    /// Handshakes complete, requests may flow.
    Ready,
    /// Connection torn down.
    Disconnected,
}

/// Everything needed to dial and validate one peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer socket address.
    pub address: SocketAddr,
    /// Peer static public key.
    pub remote_public: PublicKey,
    /// Our client identifier for Hello.
    pub client_id: String,
    /// Our network id.
    pub network_id: u64,
    /// Our genesis hash.
    pub genesis_hash: Hash32,
    /// Our current head number (checkpoint or stored head).
    pub head_number: u64,
    /// Our current head hash.
    pub head_hash: Hash32,
    /// Our cumulative difficulty at the head.
    pub head_total_difficulty: BigUint,
}

/// An established peer connection.
pub struct Peer {
    stream: TcpStream,
    codec: FrameCodec,
    state: PeerState,
    status: Option<LesStatus>,
    next_request_id: u64,
}

impl Peer {
    /// Dials `config.address`, runs the RLPx, Hello and Status handshakes
    /// and validates chain identity.
    pub async fn connect(
        config: &PeerConfig,
        static_key: &SecretKey,
        node_id: [u8; 64],
    ) -> Result<Self, ProtocolError> {
        tracing::debug!("Connecting to peer. {}", config.address);
        let mut stream = TcpStream::connect(config.address).await?;

        // Connecting → AuthSent → AuthAckReceived
        let secrets = handshake::initiate(&mut stream, static_key, &config.remote_public).await?;
        let mut peer = Self {
            stream,
            codec: FrameCodec::new(secrets),
            state: PeerState::AuthAckReceived,
            status: None,
            next_request_id: 0,
        };

        peer.hello_exchange(config, node_id).await?;
        peer.status_exchange(config).await?;
        peer.state = PeerState::Ready;
        tracing::info!("Peer ready. {}", config.address);

        Ok(peer)
    }

    async fn hello_exchange(
        &mut self,
        config: &PeerConfig,
        node_id: [u8; 64],
    ) -> Result<(), ProtocolError> {
        self.state = PeerState::HelloExchange;
        let hello = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: config.client_id.clone(),
            capabilities: vec![Capability::les2()],
            listen_port: 0,
            node_id,
        };
        self.write_message(HELLO, &hello.encode()).await?;

        let (code, data) = self.read_message_deadline(EXCHANGE_DEADLINE).await?;
        match code {
            HELLO => {
                let peer_hello = Hello::decode(&data)?;
                tracing::debug!("Peer hello. {}", peer_hello.client_id);
                if !peer_hello.supports(&Capability::les2()) {
                    self.disconnect(DisconnectReason::UselessPeer).await;
                    return Err(ProtocolError::NoSharedCapability);
                }
                Ok(())
            }
            DISCONNECT => Err(ProtocolError::Disconnected(DisconnectReason::decode(&data)?)),
            code => Err(ProtocolError::UnexpectedMessage(code)),
        }
    }

    async fn status_exchange(&mut self, config: &PeerConfig) -> Result<(), ProtocolError> {
        self.state = PeerState::StatusExchange;
        let status = LesStatus {
            protocol_version: 2,
            network_id: config.network_id,
            head_total_difficulty: config.head_total_difficulty.clone(),
            head_hash: config.head_hash,
            head_number: config.head_number,
            genesis_hash: config.genesis_hash,
            serve_headers: false,
            serve_chain_since: None,
            serve_state_since: None,
            tx_relay: false,
        };
        self.write_message(CAPABILITY_OFFSET + les::STATUS, &status.encode())
            .await?;

        let (code, data) = self.read_message_deadline(EXCHANGE_DEADLINE).await?;
        let peer_status = match code {
            code if code == CAPABILITY_OFFSET + les::STATUS => LesStatus::decode(&data)?,
            DISCONNECT => {
                return Err(ProtocolError::Disconnected(DisconnectReason::decode(&data)?));
            }
            code => return Err(ProtocolError::UnexpectedMessage(code)),
        };

        if peer_status.genesis_hash != config.genesis_hash {
            self.disconnect(DisconnectReason::UselessPeer).await;
            return Err(ProtocolError::WrongGenesis {
                ours: config.genesis_hash,
                peers: peer_status.genesis_hash,
            });
        }
        if peer_status.network_id != config.network_id {
            self.disconnect(DisconnectReason::UselessPeer).await;
            return Err(ProtocolError::WrongNetwork {
                ours: config.network_id,
                peers: peer_status.network_id,
            });
        }
        self.status = Some(peer_status);

        Ok(())
    }

    /// Reads the next frame from the peer.
    pub async fn read_message(&mut self) -> Result<(u64, Vec<u8>), ProtocolError> {
        let mut header = [0u8; 32];
        self.stream.read_exact(&mut header).await?;
        let payload_len = self.codec.read_header(&header)?;

        let mut body = vec![0u8; FrameCodec::padded_len(payload_len) + 16];
        self.stream.read_exact(&mut body).await?;

        self.codec.read_body(&body, payload_len)
    }

    async fn read_message_deadline(
        &mut self,
        deadline: Duration,
    ) -> Result<(u64, Vec<u8>), ProtocolError> {
        tokio::time::timeout(deadline, self.read_message())
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timed out",
                ))
            })?
    }

    /// Writes one frame to the peer.
    pub async fn write_message(&mut self, code: u64, data: &[u8]) -> Result<(), ProtocolError> {
        let wire = self.codec.write_frame(code, data)?;
        self.stream.write_all(&wire).await?;

        Ok(())
    }

    /// Sends a Disconnect and marks the connection dead. Write failures are
    /// ignored, the socket is going away either way.
    pub async fn disconnect(&mut self, reason: DisconnectReason) {
        tracing::debug!("Disconnecting peer. {}", reason);
        let _ignore_error = self.write_message(DISCONNECT, &reason.encode()).await;
        self.state = PeerState::Disconnected;
    }

    /// The peer's validated status announcement.
    #[must_use]
    pub fn status(&self) -> Option<&LesStatus> {
        self.status.as_ref()
    }

    /// The connection state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Splits the connection into its read and write halves so a dedicated
    /// reader task can own inbound frames. The rolling MACs are directional,
    /// so the halves stay strictly sequential within themselves.
    #[must_use]
    pub fn into_split(self) -> (PeerReader, PeerWriter) {
        let (read_half, write_half) = self.stream.into_split();
        let (egress, ingress) = self.codec.split();

        (
            PeerReader {
                read_half,
                codec: ingress,
            },
            PeerWriter {
                write_half,
                codec: egress,
                status: self.status,
                next_request_id: self.next_request_id,
            },
        )
    }
}

/// The inbound half of a split peer connection.
pub struct PeerReader {
    read_half: tokio::net::tcp::OwnedReadHalf,
    codec: crate::rlpx::IngressCodec,
}

impl PeerReader {
    /// Reads the next frame from the peer.
    pub async fn read_message(&mut self) -> Result<(u64, Vec<u8>), ProtocolError> {
        let mut header = [0u8; 32];
        self.read_half.read_exact(&mut header).await?;
        let payload_len = self.codec.read_header(&header)?;

        let mut body = vec![0u8; FrameCodec::padded_len(payload_len) + 16];
        self.read_half.read_exact(&mut body).await?;

        self.codec.read_body(&body, payload_len)
    }
}

/// The outbound half of a split peer connection.
pub struct PeerWriter {
    write_half: tokio::net::tcp::OwnedWriteHalf,
    codec: crate::rlpx::EgressCodec,
    status: Option<LesStatus>,
    next_request_id: u64,
}

impl PeerWriter {
    /// Writes one frame to the peer.
    pub async fn write_message(&mut self, code: u64, data: &[u8]) -> Result<(), ProtocolError> {
        let wire = self.codec.write_frame(code, data)?;
        self.write_half.write_all(&wire).await?;

        Ok(())
    }

    /// Sends a keepalive Ping.
    pub async fn send_ping(&mut self) -> Result<(), ProtocolError> {
        self.write_message(PING, &crate::rlp::encode_list(Vec::new())).await
    }

    /// Answers a Ping.
    pub async fn send_pong(&mut self) -> Result<(), ProtocolError> {
        self.write_message(PONG, &crate::rlp::encode_list(Vec::new())).await
    }

    /// Sends a Disconnect. Write failures are ignored, the socket is going
    /// away either way.
    pub async fn disconnect(&mut self, reason: DisconnectReason) {
        tracing::debug!("Disconnecting peer. {}", reason);
        let _ignore_error = self.write_message(DISCONNECT, &reason.encode()).await;
    }

    /// The peer's validated status announcement.
    #[must_use]
    pub fn status(&self) -> Option<&LesStatus> {
        self.status.as_ref()
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    /// Issues a forward header request, returning its request id.
    pub async fn request_headers(
        &mut self,
        origin: u64,
        amount: u64,
    ) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id();
        let request = GetBlockHeaders {
            request_id,
            origin,
            amount,
            skip: 0,
            reverse: false,
        };
        self.write_message(CAPABILITY_OFFSET + les::GET_BLOCK_HEADERS, &request.encode())
            .await?;

        Ok(request_id)
    }

    /// Issues an account proof request at `block_hash`.
    pub async fn request_account_proof(
        &mut self,
        block_hash: Hash32,
        address: Address,
    ) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id();
        let request = GetProofs {
            request_id,
            block_hash,
            address,
        };
        self.write_message(CAPABILITY_OFFSET + les::GET_PROOFS, &request.encode())
            .await?;

        Ok(request_id)
    }

    /// Relays a signed transaction.
    pub async fn send_transaction(&mut self, encoded: &[u8]) -> Result<(), ProtocolError> {
        self.write_message(CAPABILITY_OFFSET + les::SEND_TX, &les::encode_send_tx(encoded))
            .await
    }
}
