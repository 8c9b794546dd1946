//! RLPx framed transport: session secrets and the frame codec.
//!
//! Every frame is `header(16) ‖ headerMac(16) ‖ payload(⌈len/16⌉·16) ‖
//! frameMac(16)`. The two AES-CTR streams run a shared counter across the
//! whole session and the rolling Keccak MACs are mutated by every frame, so
//! encode and decode are strictly sequential per direction. A single MAC
//! mismatch desynchronises the session irrecoverably and must disconnect.

use cipher::{KeyIvInit, StreamCipher};
use sha3::{Digest, Keccak256};

use crate::crypto::{Aes256Ctr, aes256_encrypt_block};
use crate::error::ProtocolError;
use crate::rlp;

pub mod handshake;

/// Hard cap on a single frame's payload.
pub const MAX_PAYLOAD: usize = 0x0080_0000;

/// Session secrets derived by the handshake. Created once per connection and
/// destroyed on disconnect; the MAC states are consumed by the codec and
/// never reset mid-session.
pub struct Secrets {
    /// AES-256-CTR key for both frame directions.
    pub aes_key: [u8; 32],
    /// AES-256 key whitening the MAC updates.
    pub mac_key: [u8; 32],
    /// Session token, `keccak(ephemeral shared secret)`.
    pub token: [u8; 32],
    /// Rolling MAC over sent frames, seeded by the handshake transcript.
    pub egress_mac: Keccak256,
    /// Rolling MAC over received frames, seeded by the handshake transcript.
    pub ingress_mac: Keccak256,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of logs
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

fn digest16(mac: &Keccak256) -> [u8; 16] {
    let digest = mac.clone().finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);

    out
}

// The shared MAC step: whiten the current digest with AES, xor the seed in,
// absorb, and emit the truncated digest. Both header and frame MACs reduce
// to this with different seeds.
fn update_mac(mac: &mut Keccak256, mac_key: &[u8; 32], seed: &[u8; 16]) -> [u8; 16] {
    let mut block = aes256_encrypt_block(mac_key, &digest16(mac));
    for (byte, seed_byte) in block.iter_mut().zip(seed) {
        *byte ^= seed_byte;
    }
    mac.update(block);

    digest16(mac)
}

/// The sending half of a session: its cipher stream and rolling MAC.
pub struct EgressCodec {
    aes: Aes256Ctr,
    mac_key: [u8; 32],
    mac: Keccak256,
}

impl EgressCodec {
    /// Encodes one message frame, returning the wire bytes.
    pub fn write_frame(&mut self, code: u64, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut frame_data = rlp::encode_u64(code);
        frame_data.extend_from_slice(data);
        if frame_data.len() > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedFrame(frame_data.len()));
        }

        let mut header = [0u8; 16];
        header[..3].copy_from_slice(&(frame_data.len() as u32).to_be_bytes()[1..]);
        // header-data: rlp([0, 0]), zero padded
        header[3..6].copy_from_slice(&[0xc2, 0x80, 0x80]);
        self.aes.apply_keystream(&mut header);
        let header_mac = update_mac(&mut self.mac, &self.mac_key, &header);

        frame_data.resize(frame_data.len().div_ceil(16) * 16, 0);
        self.aes.apply_keystream(&mut frame_data);
        self.mac.update(&frame_data);
        let seed = digest16(&self.mac);
        let frame_mac = update_mac(&mut self.mac, &self.mac_key, &seed);

        let mut out = Vec::with_capacity(32 + frame_data.len() + 16);
        out.extend_from_slice(&header);
        out.extend_from_slice(&header_mac);
        out.extend(frame_data);
        out.extend_from_slice(&frame_mac);

        Ok(out)
    }
}

/// The receiving half of a session: its cipher stream and rolling MAC.
pub struct IngressCodec {
    aes: Aes256Ctr,
    mac_key: [u8; 32],
    mac: Keccak256,
}

impl IngressCodec {
    /// Authenticates and decrypts the 32-byte frame header, returning the
    /// payload length.
    pub fn read_header(&mut self, header: &[u8; 32]) -> Result<usize, ProtocolError> {
        let mut ciphertext = [0u8; 16];
        ciphertext.copy_from_slice(&header[..16]);
        let expected = update_mac(&mut self.mac, &self.mac_key, &ciphertext);
        if expected != header[16..] {
            return Err(ProtocolError::BadMac);
        }

        let mut plain = ciphertext;
        self.aes.apply_keystream(&mut plain);
        let length =
            usize::from(plain[0]) << 16 | usize::from(plain[1]) << 8 | usize::from(plain[2]);
        if length > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedFrame(length));
        }

        Ok(length)
    }

    /// Authenticates and decrypts a frame body (padded ciphertext plus MAC),
    /// returning the message code and its data.
    pub fn read_body(
        &mut self,
        body: &[u8],
        payload_len: usize,
    ) -> Result<(u64, Vec<u8>), ProtocolError> {
        let (ciphertext, mac) = body.split_at(body.len() - 16);
        self.mac.update(ciphertext);
        let seed = digest16(&self.mac);
        let expected = update_mac(&mut self.mac, &self.mac_key, &seed);
        if expected != mac {
            return Err(ProtocolError::BadMac);
        }

        let mut plain = ciphertext.to_vec();
        self.aes.apply_keystream(&mut plain);
        plain.truncate(payload_len);

        let (code_item, consumed) = rlp::decode_item(&plain)?;
        let code = code_item.as_u64()?;
        plain.drain(..consumed);

        Ok((code, plain))
    }
}

/// Both halves of a session's framing, as used during the handshake phase
/// while a single task still owns the socket.
pub struct FrameCodec {
    egress: EgressCodec,
    ingress: IngressCodec,
}

impl FrameCodec {
    /// Builds the codec, starting both cipher streams at counter zero.
    #[must_use]
    pub fn new(secrets: Secrets) -> Self {
        let zero_iv = [0u8; 16];
        Self {
            egress: EgressCodec {
                aes: Aes256Ctr::new(&secrets.aes_key.into(), &zero_iv.into()),
                mac_key: secrets.mac_key,
                mac: secrets.egress_mac,
            },
            ingress: IngressCodec {
                aes: Aes256Ctr::new(&secrets.aes_key.into(), &zero_iv.into()),
                mac_key: secrets.mac_key,
                mac: secrets.ingress_mac,
            },
        }
    }

    /// Encodes one message frame, returning the wire bytes.
    pub fn write_frame(&mut self, code: u64, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.egress.write_frame(code, data)
    }

    /// Authenticates and decrypts the 32-byte frame header.
    pub fn read_header(&mut self, header: &[u8; 32]) -> Result<usize, ProtocolError> {
        self.ingress.read_header(header)
    }

    /// Authenticates and decrypts a frame body.
    pub fn read_body(
        &mut self,
        body: &[u8],
        payload_len: usize,
    ) -> Result<(u64, Vec<u8>), ProtocolError> {
        self.ingress.read_body(body, payload_len)
    }

    /// Splits the codec into its directional halves for split-socket use.
    #[must_use]
    pub fn split(self) -> (EgressCodec, IngressCodec) {
        (self.egress, self.ingress)
    }

    /// The padded on-wire body size (without MAC) for a payload length.
    #[must_use]
    pub fn padded_len(payload_len: usize) -> usize {
        payload_len.div_ceil(16) * 16
    }
}

#[cfg(test)]
mod tests {
    use sha3::{Digest, Keccak256};

    use super::{FrameCodec, Secrets};

    // Mirrored secrets for the two ends of one session: A's egress MAC state
    // is B's ingress MAC state and vice versa.
    fn test_codecs() -> (FrameCodec, FrameCodec) {
        let aes_key = [0x11; 32];
        let mac_key = [0x22; 32];
        let mut mac_ab = Keccak256::new();
        mac_ab.update([0xaa; 32]);
        let mut mac_ba = Keccak256::new();
        mac_ba.update([0xbb; 32]);

        let side_a = FrameCodec::new(Secrets {
            aes_key,
            mac_key,
            token: [0; 32],
            egress_mac: mac_ab.clone(),
            ingress_mac: mac_ba.clone(),
        });
        let side_b = FrameCodec::new(Secrets {
            aes_key,
            mac_key,
            token: [0; 32],
            egress_mac: mac_ba,
            ingress_mac: mac_ab,
        });

        (side_a, side_b)
    }

    fn relay(sender: &mut FrameCodec, receiver: &mut FrameCodec, code: u64, data: &[u8]) {
        let wire = sender.write_frame(code, data).unwrap();
        let header: [u8; 32] = wire[..32].try_into().unwrap();
        let payload_len = receiver.read_header(&header).unwrap();
        let (received_code, received) = receiver.read_body(&wire[32..], payload_len).unwrap();
        assert_eq!(received_code, code);
        assert_eq!(received, data);
    }

    #[test]
    fn frames_round_trip_in_sequence() {
        let (mut side_a, mut side_b) = test_codecs();
        relay(&mut side_a, &mut side_b, 0x00, b"hello frame");
        relay(&mut side_a, &mut side_b, 0x10, &[0u8; 100]);
        relay(&mut side_a, &mut side_b, 0x12, b"");
        // opposite direction uses its own MAC pair
        relay(&mut side_b, &mut side_a, 0x02, b"ping");
    }

    #[test]
    fn identical_sessions_produce_identical_frames() {
        let (mut first, _) = test_codecs();
        let (mut second, _) = test_codecs();

        for code in 0..4u64 {
            let frame_one = first.write_frame(code, b"deterministic").unwrap();
            let frame_two = second.write_frame(code, b"deterministic").unwrap();
            assert_eq!(frame_one, frame_two);
        }
    }

    #[test]
    fn tampered_header_fails_mac() {
        let (mut side_a, mut side_b) = test_codecs();
        let wire = side_a.write_frame(0x00, b"payload").unwrap();
        let mut header: [u8; 32] = wire[..32].try_into().unwrap();
        header[0] ^= 0x01;
        assert!(side_b.read_header(&header).is_err());
    }

    #[test]
    fn tampered_body_fails_mac() {
        let (mut side_a, mut side_b) = test_codecs();
        let mut wire = side_a.write_frame(0x00, b"payload").unwrap();
        let header: [u8; 32] = wire[..32].try_into().unwrap();
        let payload_len = side_b.read_header(&header).unwrap();
        wire[33] ^= 0x01;
        assert!(side_b.read_body(&wire[32..], payload_len).is_err());
    }

    #[test]
    fn reordered_frames_desynchronise() {
        let (mut side_a, mut side_b) = test_codecs();
        let first = side_a.write_frame(0x00, b"first").unwrap();
        let second = side_a.write_frame(0x00, b"second").unwrap();

        // delivering the second frame first must fail the header MAC
        let header: [u8; 32] = second[..32].try_into().unwrap();
        assert!(side_b.read_header(&header).is_err());
        drop(first);
    }
}
