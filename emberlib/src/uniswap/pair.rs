//! Uniswap V2 pairs and constant-product math.

use num_bigint::BigUint;
use num_traits::Zero;

use ember_sync::crypto::keccak256;
use ember_sync::primitives::Address;

/// Output of a swap at 0.3 % fee:
/// `(amountIn · 997 · rOut) / (rIn · 1000 + amountIn · 997)`.
#[must_use]
pub fn amount_out(amount_in: &BigUint, reserve_in: &BigUint, reserve_out: &BigUint) -> BigUint {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return BigUint::zero();
    }
    let amount_with_fee = amount_in * 997u32;
    let numerator = &amount_with_fee * reserve_out;
    let denominator = reserve_in * 1000u32 + amount_with_fee;

    numerator / denominator
}

/// Input required for an exact output, rounded up:
/// `(rIn · amountOut · 1000) / ((rOut − amountOut) · 997) + 1`.
/// `None` when the pool cannot produce `amount_out`.
#[must_use]
pub fn amount_in(
    amount_out: &BigUint,
    reserve_in: &BigUint,
    reserve_out: &BigUint,
) -> Option<BigUint> {
    if amount_out.is_zero() || reserve_in.is_zero() || amount_out >= reserve_out {
        return None;
    }
    let numerator = reserve_in * amount_out * 1000u32;
    let denominator = (reserve_out - amount_out) * 997u32;

    Some(numerator / denominator + 1u32)
}

/// A pair's reserves, tokens ordered by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    token0: Address,
    token1: Address,
    reserve0: BigUint,
    reserve1: BigUint,
}

impl Pair {
    /// Builds a pair from unordered token/reserve tuples.
    #[must_use]
    pub fn new(token_a: Address, reserve_a: BigUint, token_b: Address, reserve_b: BigUint) -> Self {
        if token_a < token_b {
            Self {
                token0: token_a,
                token1: token_b,
                reserve0: reserve_a,
                reserve1: reserve_b,
            }
        } else {
            Self {
                token0: token_b,
                token1: token_a,
                reserve0: reserve_b,
                reserve1: reserve_a,
            }
        }
    }

    /// The deterministic pair contract address:
    /// `keccak(0xff ‖ factory ‖ keccak(token0 ‖ token1) ‖ initCodeHash)[12..]`.
    #[must_use]
    pub fn contract_address(
        token_a: Address,
        token_b: Address,
        factory: Address,
        init_code_hash: &[u8; 32],
    ) -> Address {
        let (token0, token1) = if token_a < token_b {
            (token_a, token_b)
        } else {
            (token_b, token_a)
        };

        let mut salt_input = [0u8; 40];
        salt_input[..20].copy_from_slice(token0.as_bytes());
        salt_input[20..].copy_from_slice(token1.as_bytes());
        let salt = keccak256(&salt_input);

        let mut preimage = Vec::with_capacity(85);
        preimage.push(0xff);
        preimage.extend_from_slice(factory.as_bytes());
        preimage.extend_from_slice(&salt);
        preimage.extend_from_slice(init_code_hash);

        let digest = keccak256(&preimage);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);

        Address::new(address)
    }

    /// Parses a `getReserves()` reply: three 32-byte words, `(reserve0,
    /// reserve1, blockTimestampLast)`. Any other length means the pair does
    /// not exist and its reserves are zero.
    #[must_use]
    pub fn parse_reserves(output: &[u8]) -> (BigUint, BigUint) {
        if output.len() != 96 {
            return (BigUint::zero(), BigUint::zero());
        }

        (
            BigUint::from_bytes_be(&output[..32]),
            BigUint::from_bytes_be(&output[32..64]),
        )
    }

    /// The lower-addressed token.
    #[must_use]
    pub fn token0(&self) -> Address {
        self.token0
    }

    /// The higher-addressed token.
    #[must_use]
    pub fn token1(&self) -> Address {
        self.token1
    }

    /// Whether `token` is one side of this pair.
    #[must_use]
    pub fn involves(&self, token: &Address) -> bool {
        self.token0 == *token || self.token1 == *token
    }

    /// The opposite side of `token`.
    #[must_use]
    pub fn other(&self, token: &Address) -> Address {
        if self.token0 == *token {
            self.token1
        } else {
            self.token0
        }
    }

    fn oriented_reserves(&self, token_in: &Address) -> (&BigUint, &BigUint) {
        if self.token0 == *token_in {
            (&self.reserve0, &self.reserve1)
        } else {
            (&self.reserve1, &self.reserve0)
        }
    }

    /// Forward quote: what `amount_in` of `token_in` buys from this pair.
    #[must_use]
    pub fn output_amount(&self, token_in: &Address, amount: &BigUint) -> Option<BigUint> {
        if !self.involves(token_in) {
            return None;
        }
        let (reserve_in, reserve_out) = self.oriented_reserves(token_in);
        if reserve_in.is_zero() || reserve_out.is_zero() {
            return None;
        }

        Some(amount_out(amount, reserve_in, reserve_out))
    }

    /// Backward quote: what this pair charges in the opposite token for an
    /// exact `amount` of `token_out`.
    #[must_use]
    pub fn input_amount(&self, token_out: &Address, amount: &BigUint) -> Option<BigUint> {
        if !self.involves(token_out) {
            return None;
        }
        let (reserve_out, reserve_in) = self.oriented_reserves(token_out);

        amount_in(amount, reserve_in, reserve_out)
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use num_traits::Zero;

    use ember_sync::primitives::Address;

    use super::{Pair, amount_in, amount_out};

    #[test]
    fn pair_orders_tokens_by_address() {
        let low = Address::new([0x01; 20]);
        let high = Address::new([0xff; 20]);
        let pair = Pair::new(high, BigUint::from(5u32), low, BigUint::from(9u32));
        assert_eq!(pair.token0(), low);
        assert_eq!(pair.other(&low), high);
        assert_eq!(
            pair.output_amount(&high, &BigUint::from(1u32)),
            Some(amount_out(
                &BigUint::from(1u32),
                &BigUint::from(5u32),
                &BigUint::from(9u32)
            ))
        );
    }

    #[test]
    fn usdc_weth_pair_address() {
        let usdc = Address::parse("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        let weth = Address::parse("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2").unwrap();
        let factory = Address::parse("0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f").unwrap();
        let init_code_hash: [u8; 32] = hex_literal::hex!(
            "96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbee326c3e7da348845f"
        );

        assert_eq!(
            Pair::contract_address(usdc, weth, factory, &init_code_hash),
            Address::parse("0xB4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc").unwrap()
        );
    }

    #[test]
    fn constant_product_quotes() {
        let out = amount_out(
            &BigUint::from(100u32),
            &BigUint::from(1000u32),
            &BigUint::from(2000u32),
        );
        assert_eq!(out, BigUint::from(181u32));

        // exact-out refuses to drain the pool
        assert!(
            amount_in(
                &BigUint::from(2000u32),
                &BigUint::from(1000u32),
                &BigUint::from(2000u32)
            )
            .is_none()
        );
    }

    #[test]
    fn exact_out_round_trip_is_sufficient_and_tight() {
        for (reserve_in, reserve_out, input) in [
            (1_000u64, 2_000u64, 100u64),
            (5_000, 4_000, 250),
            (1_000_000_000, 3_000_000_000, 12_345_678),
        ] {
            let reserve_in = BigUint::from(reserve_in);
            let reserve_out = BigUint::from(reserve_out);
            let input = BigUint::from(input);

            let output = amount_out(&input, &reserve_in, &reserve_out);
            let recovered = amount_in(&output, &reserve_in, &reserve_out).unwrap();
            // the recovered input buys at least the quoted output and, up to
            // the +1 rounding, never exceeds what was originally paid
            assert!(amount_out(&recovered, &reserve_in, &reserve_out) >= output);
            assert!(recovered <= &input + BigUint::from(1u32));
        }
    }

    #[test]
    fn reserve_replies_must_be_three_words() {
        let mut output = vec![0u8; 96];
        output[31] = 7;
        output[63] = 9;
        let (reserve0, reserve1) = Pair::parse_reserves(&output);
        assert_eq!(reserve0, BigUint::from(7u32));
        assert_eq!(reserve1, BigUint::from(9u32));

        let (reserve0, reserve1) = Pair::parse_reserves(&[0u8; 64]);
        assert!(reserve0.is_zero() && reserve1.is_zero());
    }
}
