//! Byte-array newtypes shared across the engine.
//!
//! IMPORTANT:
//! - These types participate in hashing and wire encoding. Equality is
//!   byte-wise, display is checksummed (EIP-55) for addresses and 0x-prefixed
//!   hex for hashes.

use crate::crypto::keccak256;

/// Reasons an address string fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Input is not 40 hex digits (plus optional `0x` prefix).
    #[error("invalid address length")]
    Length,
    /// Input contains a non-hex character.
    #[error("invalid hex digit in address")]
    Hex,
    /// Input is mixed-case and the EIP-55 checksum does not match.
    #[error("EIP-55 checksum mismatch")]
    Checksum,
}

/// A 20-byte account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Wraps raw address bytes. No checksum applies to byte input.
    #[must_use]
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses and validates an address string.
    ///
    /// Accepts 40 hex digits with an optional `0x` prefix. All-lowercase and
    /// all-uppercase inputs carry no checksum; mixed-case inputs must satisfy
    /// EIP-55.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let hex_digits = input.strip_prefix("0x").unwrap_or(input);
        if hex_digits.len() != 40 {
            return Err(AddressError::Length);
        }
        if !hex_digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::Hex);
        }

        let all_lower = !hex_digits.chars().any(|c| c.is_ascii_uppercase());
        let all_upper = !hex_digits.chars().any(|c| c.is_ascii_lowercase());
        if !all_lower && !all_upper && hex_digits != checksum_digits(hex_digits) {
            return Err(AddressError::Checksum);
        }

        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex_digits.to_ascii_lowercase(), &mut bytes)
            .map_err(|_| AddressError::Hex)?;

        Ok(Self(bytes))
    }

    /// Returns the address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// EIP-55 checksummed display form with `0x` prefix.
    #[must_use]
    pub fn to_checksum_string(&self) -> String {
        format!("0x{}", checksum_digits(&hex::encode(self.0)))
    }
}

/// Uppercases each hex digit whose corresponding keccak nibble is >= 8.
fn checksum_digits(hex_digits: &str) -> String {
    let lowercase = hex_digits.to_ascii_lowercase();
    let digest = keccak256(lowercase.as_bytes());

    lowercase
        .char_indices()
        .map(|(i, c)| {
            let nibble = if i % 2 == 0 {
                digest[i / 2] >> 4
            } else {
                digest[i / 2] & 0x0f
            };
            if c.is_ascii_alphabetic() && nibble >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_checksum_string())
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.to_checksum_string())
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// A 32-byte Keccak-256 digest: block hashes, transaction hashes, roots.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// Wraps raw digest bytes.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a 64-digit hex string with optional `0x` prefix.
    pub fn parse(input: &str) -> Result<Self, hex::FromHexError> {
        let digits = input.strip_prefix("0x").unwrap_or(input);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes)?;

        Ok(Self(bytes))
    }

    /// Returns the digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32(0x{})", hex::encode(self.0))
    }
}

impl std::str::FromStr for Hash32 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{Address, AddressError};

    #[test]
    fn accepts_checksummed_address() {
        let address = Address::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        assert_eq!(
            address.to_checksum_string(),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn rejects_bad_checksum() {
        assert_eq!(
            Address::parse("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
            Err(AddressError::Checksum)
        );
    }

    #[test]
    fn accepts_uncased_addresses() {
        Address::parse("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap();
        Address::parse("0x5AAEB6053F3E94C9B9A09F33669435E7EF1BEAED").unwrap();
    }

    #[test]
    fn rejects_bad_length_and_hex() {
        assert_eq!(Address::parse("0x1234"), Err(AddressError::Length));
        assert_eq!(
            Address::parse("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaeg"),
            Err(AddressError::Hex)
        );
    }

    #[test]
    fn checksum_display_matches_known_vectors() {
        for vector in [
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ] {
            let address = Address::parse(vector).unwrap();
            assert_eq!(address.to_checksum_string(), vector);
        }
    }
}
