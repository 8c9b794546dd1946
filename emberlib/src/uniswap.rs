//! Uniswap V2 trade planning on top of the client's read and send
//! operations.

use num_bigint::BigUint;

use ember_sync::primitives::Address;
use ember_sync::transaction::Transaction;

use crate::client::EthereumClient;
use crate::client::error::ClientError;
use crate::utils::abi_selector;

use pair::Pair;
use trade::{ContractCall, Trade, best_trade, trades_exact_in, trades_exact_out};

pub mod pair;
pub mod trade;

/// Default hop bound for route search.
pub const DEFAULT_MAX_HOPS: usize = 3;

/// Uniswap V2 factory on mainnet.
pub const MAINNET_FACTORY: &str = "0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f";
/// Uniswap V2 router 02 on mainnet.
pub const MAINNET_ROUTER: &str = "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D";
/// Wrapped ether on mainnet.
pub const MAINNET_WETH: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
/// Pair contract init code hash.
pub const PAIR_INIT_CODE_HASH: [u8; 32] = hex_literal::hex!(
    "96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbee326c3e7da348845f"
);

/// One side of a planned swap. Ether routes through wrapped ether pairs but
/// selects the ETH router methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapToken {
    /// The native coin.
    Ether,
    /// An ERC-20 token.
    Erc20(Address),
}

impl SwapToken {
    fn pair_token(&self, weth: Address) -> Address {
        match self {
            Self::Ether => weth,
            Self::Erc20(address) => *address,
        }
    }

    fn is_ether(&self) -> bool {
        matches!(self, Self::Ether)
    }
}

/// Plans and executes swaps against one Uniswap V2 deployment.
pub struct TradePlanner<'a> {
    client: &'a EthereumClient,
    /// Factory the pair addresses derive from.
    pub factory: Address,
    /// Router the swap calls target.
    pub router: Address,
    /// Pair init code hash for address derivation.
    pub init_code_hash: [u8; 32],
    /// Wrapped ether address for routing.
    pub weth: Address,
}

impl<'a> TradePlanner<'a> {
    /// A planner for the canonical mainnet deployment.
    #[must_use]
    pub fn mainnet(client: &'a EthereumClient) -> Self {
        Self {
            client,
            factory: Address::parse(MAINNET_FACTORY).expect("factory constant parses"),
            router: Address::parse(MAINNET_ROUTER).expect("router constant parses"),
            init_code_hash: PAIR_INIT_CODE_HASH,
            weth: Address::parse(MAINNET_WETH).expect("weth constant parses"),
        }
    }

    /// Fetches current reserves for the pair of two tokens.
    ///
    /// A malformed or empty `getReserves` reply yields a pair with zero
    /// reserves, which the route search skips.
    pub async fn fetch_pair(
        &self,
        token_a: SwapToken,
        token_b: SwapToken,
    ) -> Result<Pair, ClientError> {
        let token_a = token_a.pair_token(self.weth);
        let token_b = token_b.pair_token(self.weth);
        let pair_address =
            Pair::contract_address(token_a, token_b, self.factory, &self.init_code_hash);

        let output = self
            .client
            .call(pair_address, abi_selector("getReserves()").to_vec())
            .await?;
        let (reserve0, reserve1) = Pair::parse_reserves(&output);

        // parse_reserves reports in token0 < token1 order
        let (token0, token1) = if token_a < token_b {
            (token_a, token_b)
        } else {
            (token_b, token_a)
        };

        Ok(Pair::new(token0, reserve0, token1, reserve1))
    }

    /// The best exact-in route over `pairs`, if any exists within
    /// [`DEFAULT_MAX_HOPS`].
    #[must_use]
    pub fn plan_exact_in(
        &self,
        pairs: &[Pair],
        token_in: SwapToken,
        amount_in: &BigUint,
        token_out: SwapToken,
    ) -> Option<Trade> {
        best_trade(trades_exact_in(
            pairs,
            token_in.pair_token(self.weth),
            amount_in,
            token_out.pair_token(self.weth),
            DEFAULT_MAX_HOPS,
        ))
    }

    /// The best exact-out route over `pairs`, if any exists within
    /// [`DEFAULT_MAX_HOPS`].
    #[must_use]
    pub fn plan_exact_out(
        &self,
        pairs: &[Pair],
        token_in: SwapToken,
        token_out: SwapToken,
        amount_out: &BigUint,
    ) -> Option<Trade> {
        best_trade(trades_exact_out(
            pairs,
            token_in.pair_token(self.weth),
            token_out.pair_token(self.weth),
            amount_out,
            DEFAULT_MAX_HOPS,
        ))
    }

    /// Assembles the router calls for `trade`, including the `approve`
    /// precursor for ERC-20 sources.
    #[must_use]
    pub fn swap_calls(
        &self,
        trade: &Trade,
        token_in: SwapToken,
        token_out: SwapToken,
        fee_on_transfer: bool,
        amount_limit: &BigUint,
        deadline: u64,
    ) -> Vec<ContractCall> {
        trade::swap_calls(
            trade,
            token_in.is_ether(),
            token_out.is_ether(),
            fee_on_transfer,
            amount_limit,
            &self.client.receive_address(),
            deadline,
            self.router,
        )
    }

    /// Signs and broadcasts the assembled calls in order, returning the
    /// resulting transactions.
    pub async fn execute(
        &self,
        calls: Vec<ContractCall>,
        gas_price: u64,
        gas_limit: u64,
    ) -> Result<Vec<Transaction>, ClientError> {
        let mut transactions = Vec::with_capacity(calls.len());
        for call in calls {
            transactions.push(
                self.client
                    .send(call.to, call.value, call.data, gas_price, Some(gas_limit))
                    .await?,
            );
        }

        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use ember_sync::primitives::Address;

    use crate::client::EthereumClient;
    use crate::config::{ChainType, EmberConfig};

    use super::{SwapToken, TradePlanner, pair::Pair};

    fn test_client() -> EthereumClient {
        EthereumClient::new(
            EmberConfig::build(ChainType::Mainnet).create(),
            &[0x46; 32],
        )
        .unwrap()
    }

    #[test]
    fn ether_plans_route_through_weth() {
        let client = test_client();
        let planner = TradePlanner::mainnet(&client);
        let token = Address::new([0xaa; 20]);
        let pair = Pair::new(
            planner.weth,
            BigUint::from(1_000u32),
            token,
            BigUint::from(2_000u32),
        );

        let trade = planner
            .plan_exact_in(
                &[pair],
                SwapToken::Ether,
                &BigUint::from(100u32),
                SwapToken::Erc20(token),
            )
            .unwrap();
        assert_eq!(trade.path, vec![planner.weth, token]);

        // ether source selects an ETH method and skips approve
        let calls = planner.swap_calls(
            &trade,
            SwapToken::Ether,
            SwapToken::Erc20(token),
            false,
            &BigUint::from(1u32),
            1_700_000_000,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].to, planner.router);
    }

    #[test]
    fn token_source_gets_approve_against_router() {
        let client = test_client();
        let planner = TradePlanner::mainnet(&client);
        let token_in = Address::new([0x11; 20]);
        let token_out = Address::new([0x22; 20]);
        let pair = Pair::new(
            token_in,
            BigUint::from(9_000u32),
            token_out,
            BigUint::from(9_000u32),
        );

        let trade = planner
            .plan_exact_in(
                &[pair],
                SwapToken::Erc20(token_in),
                &BigUint::from(100u32),
                SwapToken::Erc20(token_out),
            )
            .unwrap();
        let calls = planner.swap_calls(
            &trade,
            SwapToken::Erc20(token_in),
            SwapToken::Erc20(token_out),
            false,
            &BigUint::from(1u32),
            1_700_000_000,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].to, token_in);
        assert_eq!(calls[1].to, planner.router);
    }
}
