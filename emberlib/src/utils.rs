//! Conversion helpers: wei amounts, hex strings and ABI words.

use num_bigint::BigUint;

use ember_sync::crypto::keccak256;
use ember_sync::primitives::Address;

/// Wei per ether, `10^18`.
#[must_use]
pub fn wei_per_ether() -> BigUint {
    BigUint::from(10u64).pow(18)
}

/// Converts a whole-ether amount to wei.
#[must_use]
pub fn ether_to_wei(ether: u64) -> BigUint {
    BigUint::from(ether) * wei_per_ether()
}

/// Parses a decimal wei string.
#[must_use]
pub fn wei_from_decimal(decimal: &str) -> Option<BigUint> {
    BigUint::parse_bytes(decimal.as_bytes(), 10)
}

/// The 4-byte ABI selector of a function signature.
#[must_use]
pub fn abi_selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&digest[..4]);

    selector
}

/// A left-padded 32-byte ABI word for an unsigned integer.
#[must_use]
pub fn abi_word_uint(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);

    word
}

/// A left-padded 32-byte ABI word for an address.
#[must_use]
pub fn abi_word_address(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());

    word
}

/// A 32-byte ABI word for a u64.
#[must_use]
pub fn abi_word_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());

    word
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::{abi_selector, abi_word_uint, ether_to_wei, wei_from_decimal};

    #[test]
    fn known_selectors() {
        assert_eq!(abi_selector("approve(address,uint256)"), [0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(abi_selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(abi_selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(abi_selector("getReserves()"), [0x09, 0x02, 0xf1, 0xac]);
    }

    #[test]
    fn wei_conversions() {
        assert_eq!(
            ether_to_wei(1),
            wei_from_decimal("1000000000000000000").unwrap()
        );
        assert!(wei_from_decimal("not a number").is_none());
    }

    #[test]
    fn abi_words_are_left_padded() {
        let word = abi_word_uint(&BigUint::from(0x1234u32));
        assert_eq!(&word[30..], &[0x12, 0x34]);
        assert!(word[..30].iter().all(|byte| *byte == 0));
    }
}
