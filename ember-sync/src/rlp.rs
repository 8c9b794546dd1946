//! Canonical RLP encoding and decoding.
//!
//! Encoding follows the yellow paper exactly: integers are minimal big-endian
//! byte strings (zero is the empty string), a single byte below 0x80 encodes
//! itself, short strings are prefixed with `0x80 + len`, long strings with
//! `0xb7 + len(len)`, lists analogously from `0xc0`/`0xf7`.
//!
//! Decoding rejects non-canonical length prefixes but tolerates leading-zero
//! integers, which some peer implementations still emit.

use num_bigint::BigUint;

/// Errors raised while decoding RLP input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RlpError {
    /// Input ended before the announced length.
    #[error("unexpected end of RLP input")]
    UnexpectedEof,
    /// A length prefix is valid RLP but not the shortest possible form.
    #[error("non-canonical RLP length prefix")]
    NonCanonical,
    /// The outer item ended before the input did.
    #[error("trailing bytes after RLP item")]
    TrailingBytes,
    /// A byte string was expected but a list was found, or vice versa.
    #[error("RLP item has unexpected kind")]
    UnexpectedKind,
    /// An integer field does not fit the requested width.
    #[error("RLP integer overflows target type")]
    IntegerOverflow,
}

/// A decoded RLP item: either a byte string or a list of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Byte string payload.
    Bytes(Vec<u8>),
    /// Nested list of items.
    List(Vec<Item>),
}

impl Item {
    /// Returns the byte payload, or an error for lists.
    pub fn as_bytes(&self) -> Result<&[u8], RlpError> {
        match self {
            Item::Bytes(bytes) => Ok(bytes),
            Item::List(_) => Err(RlpError::UnexpectedKind),
        }
    }

    /// Returns the list elements, or an error for byte strings.
    pub fn as_list(&self) -> Result<&[Item], RlpError> {
        match self {
            Item::List(items) => Ok(items),
            Item::Bytes(_) => Err(RlpError::UnexpectedKind),
        }
    }

    /// Interprets the payload as a big-endian u64. Leading zeros tolerated.
    pub fn as_u64(&self) -> Result<u64, RlpError> {
        let bytes = self.as_bytes()?;
        let stripped: &[u8] = match bytes.iter().position(|b| *b != 0) {
            Some(first) => &bytes[first..],
            None => &[],
        };
        if stripped.len() > 8 {
            return Err(RlpError::IntegerOverflow);
        }

        Ok(stripped.iter().fold(0u64, |n, b| (n << 8) | u64::from(*b)))
    }

    /// Interprets the payload as a big-endian unsigned integer.
    pub fn as_biguint(&self) -> Result<BigUint, RlpError> {
        Ok(BigUint::from_bytes_be(self.as_bytes()?))
    }

    /// Interprets the payload as a fixed-width byte array.
    pub fn as_array<const N: usize>(&self) -> Result<[u8; N], RlpError> {
        let bytes = self.as_bytes()?;
        let mut out = [0u8; N];
        if bytes.len() != N {
            return Err(RlpError::UnexpectedKind);
        }
        out.copy_from_slice(bytes);

        Ok(out)
    }

    /// Re-encodes this item canonically.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Item::Bytes(bytes) => encode_bytes(bytes),
            Item::List(items) => {
                let mut payload = Vec::new();
                for item in items {
                    payload.extend(item.encode());
                }
                encode_list(payload)
            }
        }
    }
}

/// Encodes a byte string.
#[must_use]
pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return vec![bytes[0]];
    }
    let mut out = length_prefix(bytes.len(), 0x80);
    out.extend_from_slice(bytes);

    out
}

/// Encodes an unsigned integer as its minimal big-endian byte string.
#[must_use]
pub fn encode_u64(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(8);

    encode_bytes(&bytes[first..])
}

/// Encodes an arbitrary-precision unsigned integer.
#[must_use]
pub fn encode_biguint(value: &BigUint) -> Vec<u8> {
    use num_traits::Zero;

    if value.is_zero() {
        encode_bytes(&[])
    } else {
        encode_bytes(&value.to_bytes_be())
    }
}

/// Wraps already-encoded items into a list.
#[must_use]
pub fn encode_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = length_prefix(payload.len(), 0xc0);
    out.extend(payload);

    out
}

fn length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len <= 55 {
        vec![offset + len as u8]
    } else {
        let len_bytes = len.to_be_bytes();
        let first = len_bytes.iter().position(|b| *b != 0).unwrap_or(7);
        let mut out = vec![offset + 55 + (len_bytes.len() - first) as u8];
        out.extend_from_slice(&len_bytes[first..]);

        out
    }
}

/// Decodes a complete RLP input. The whole slice must be one item.
pub fn decode(input: &[u8]) -> Result<Item, RlpError> {
    let (item, consumed) = decode_item(input)?;
    if consumed != input.len() {
        return Err(RlpError::TrailingBytes);
    }

    Ok(item)
}

/// Decodes the item at the start of `input`, returning `(item, consumed)`.
pub fn decode_item(input: &[u8]) -> Result<(Item, usize), RlpError> {
    let first = *input.first().ok_or(RlpError::UnexpectedEof)?;
    match first {
        0x00..=0x7f => Ok((Item::Bytes(vec![first]), 1)),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            let payload = slice(input, 1, len)?;
            if len == 1 && payload[0] < 0x80 {
                return Err(RlpError::NonCanonical);
            }
            Ok((Item::Bytes(payload.to_vec()), 1 + len))
        }
        0xb8..=0xbf => {
            let (len, header) = long_length(input, first - 0xb7)?;
            let payload = slice(input, header, len)?;
            Ok((Item::Bytes(payload.to_vec()), header + len))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            let payload = slice(input, 1, len)?;
            Ok((Item::List(decode_list_payload(payload)?), 1 + len))
        }
        0xf8..=0xff => {
            let (len, header) = long_length(input, first - 0xf7)?;
            let payload = slice(input, header, len)?;
            Ok((Item::List(decode_list_payload(payload)?), header + len))
        }
    }
}

fn long_length(input: &[u8], len_of_len: u8) -> Result<(usize, usize), RlpError> {
    let len_bytes = slice(input, 1, len_of_len as usize)?;
    if len_bytes[0] == 0 {
        return Err(RlpError::NonCanonical);
    }
    let mut len = 0usize;
    for byte in len_bytes {
        len = len
            .checked_mul(256)
            .and_then(|n| n.checked_add(*byte as usize))
            .ok_or(RlpError::IntegerOverflow)?;
    }
    if len <= 55 {
        return Err(RlpError::NonCanonical);
    }

    Ok((len, 1 + len_of_len as usize))
}

fn decode_list_payload(mut payload: &[u8]) -> Result<Vec<Item>, RlpError> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, consumed) = decode_item(payload)?;
        items.push(item);
        payload = &payload[consumed..];
    }

    Ok(items)
}

fn slice(input: &[u8], start: usize, len: usize) -> Result<&[u8], RlpError> {
    input
        .get(start..start + len)
        .ok_or(RlpError::UnexpectedEof)
}
