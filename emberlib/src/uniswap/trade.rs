//! Depth-limited trade search over pair reserves and router calldata
//! assembly.

use num_bigint::BigUint;

use ember_sync::primitives::Address;

use crate::utils::{abi_selector, abi_word_address, abi_word_u64, abi_word_uint};

use super::pair::Pair;

/// Quote direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeType {
    /// The input amount is fixed; maximise output.
    ExactIn,
    /// The output amount is fixed; minimise input.
    ExactOut,
}

/// One candidate route with its quoted amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    /// Quote direction.
    pub trade_type: TradeType,
    /// Token route, input first.
    pub path: Vec<Address>,
    /// Amount entering the first hop.
    pub amount_in: BigUint,
    /// Amount leaving the last hop.
    pub amount_out: BigUint,
}

/// Enumerates every route of at most `max_hops` hops that turns `amount_in`
/// of `token_in` into `token_out`.
#[must_use]
pub fn trades_exact_in(
    pairs: &[Pair],
    token_in: Address,
    amount_in: &BigUint,
    token_out: Address,
    max_hops: usize,
) -> Vec<Trade> {
    let mut trades = Vec::new();
    explore_exact_in(
        pairs,
        token_in,
        amount_in.clone(),
        token_out,
        max_hops,
        &mut vec![token_in],
        amount_in,
        &mut trades,
    );

    trades
}

#[allow(clippy::too_many_arguments)]
fn explore_exact_in(
    pairs: &[Pair],
    current_token: Address,
    current_amount: BigUint,
    token_out: Address,
    max_hops: usize,
    path: &mut Vec<Address>,
    original_amount_in: &BigUint,
    trades: &mut Vec<Trade>,
) {
    for (index, pair) in pairs.iter().enumerate() {
        let Some(output) = pair.output_amount(&current_token, &current_amount) else {
            continue;
        };
        let next_token = pair.other(&current_token);

        if next_token == token_out {
            let mut full_path = path.clone();
            full_path.push(token_out);
            trades.push(Trade {
                trade_type: TradeType::ExactIn,
                path: full_path,
                amount_in: original_amount_in.clone(),
                amount_out: output,
            });
        } else if max_hops > 1 && pairs.len() > 1 {
            let mut remaining = pairs.to_vec();
            remaining.remove(index);
            path.push(next_token);
            explore_exact_in(
                &remaining,
                next_token,
                output,
                token_out,
                max_hops - 1,
                path,
                original_amount_in,
                trades,
            );
            path.pop();
        }
    }
}

/// Enumerates every route of at most `max_hops` hops that produces exactly
/// `amount_out` of `token_out` from `token_in`.
#[must_use]
pub fn trades_exact_out(
    pairs: &[Pair],
    token_in: Address,
    token_out: Address,
    amount_out: &BigUint,
    max_hops: usize,
) -> Vec<Trade> {
    let mut trades = Vec::new();
    explore_exact_out(
        pairs,
        token_in,
        token_out,
        amount_out.clone(),
        max_hops,
        &mut vec![token_out],
        amount_out,
        &mut trades,
    );

    trades
}

// Mirror of the forward search: walk from the output token towards the
// input, accumulating the required input.
#[allow(clippy::too_many_arguments)]
fn explore_exact_out(
    pairs: &[Pair],
    token_in: Address,
    current_token: Address,
    current_amount: BigUint,
    max_hops: usize,
    reverse_path: &mut Vec<Address>,
    original_amount_out: &BigUint,
    trades: &mut Vec<Trade>,
) {
    for (index, pair) in pairs.iter().enumerate() {
        let Some(input) = pair.input_amount(&current_token, &current_amount) else {
            continue;
        };
        let previous_token = pair.other(&current_token);

        if previous_token == token_in {
            let mut path = vec![token_in];
            path.extend(reverse_path.iter().rev().copied());
            trades.push(Trade {
                trade_type: TradeType::ExactOut,
                path,
                amount_in: input,
                amount_out: original_amount_out.clone(),
            });
        } else if max_hops > 1 && pairs.len() > 1 {
            let mut remaining = pairs.to_vec();
            remaining.remove(index);
            reverse_path.push(previous_token);
            explore_exact_out(
                &remaining,
                token_in,
                previous_token,
                input,
                max_hops - 1,
                reverse_path,
                original_amount_out,
                trades,
            );
            reverse_path.pop();
        }
    }
}

/// Selects the best quote: highest output for exact-in, lowest input for
/// exact-out, shorter path on ties.
#[must_use]
pub fn best_trade(trades: Vec<Trade>) -> Option<Trade> {
    trades.into_iter().reduce(|best, candidate| {
        let candidate_wins = match candidate.trade_type {
            TradeType::ExactIn => match candidate.amount_out.cmp(&best.amount_out) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => candidate.path.len() < best.path.len(),
                std::cmp::Ordering::Less => false,
            },
            TradeType::ExactOut => match candidate.amount_in.cmp(&best.amount_in) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => candidate.path.len() < best.path.len(),
                std::cmp::Ordering::Greater => false,
            },
        };
        if candidate_wins { candidate } else { best }
    })
}

/// A contract call ready for the controller's send operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    /// Target contract.
    pub to: Address,
    /// Attached value in wei.
    pub value: BigUint,
    /// ABI-encoded call data.
    pub data: Vec<u8>,
}

/// Assembles the router calls executing `trade`.
///
/// `amount_limit` is the slippage bound: the minimum acceptable output for
/// exact-in, the maximum acceptable input for exact-out. ERC-20 sources are
/// preceded by an `approve(router, amount)` call.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn swap_calls(
    trade: &Trade,
    ether_in: bool,
    ether_out: bool,
    fee_on_transfer: bool,
    amount_limit: &BigUint,
    recipient: &Address,
    deadline: u64,
    router: Address,
) -> Vec<ContractCall> {
    let signature = method_signature(trade.trade_type, ether_in, ether_out, fee_on_transfer);

    let (value, amounts): (BigUint, Vec<&BigUint>) = match (trade.trade_type, ether_in) {
        // the input rides along as message value
        (TradeType::ExactIn, true) => (trade.amount_in.clone(), vec![amount_limit]),
        (TradeType::ExactOut, true) => (amount_limit.clone(), vec![&trade.amount_out]),
        (TradeType::ExactIn, false) => (BigUint::default(), vec![&trade.amount_in, amount_limit]),
        (TradeType::ExactOut, false) => {
            (BigUint::default(), vec![&trade.amount_out, amount_limit])
        }
    };

    let mut calls = Vec::new();
    if !ether_in {
        let approved = match trade.trade_type {
            TradeType::ExactIn => &trade.amount_in,
            TradeType::ExactOut => amount_limit,
        };
        let mut data = abi_selector("approve(address,uint256)").to_vec();
        data.extend_from_slice(&abi_word_address(&router));
        data.extend_from_slice(&abi_word_uint(approved));
        calls.push(ContractCall {
            to: trade.path[0],
            value: BigUint::default(),
            data,
        });
    }

    calls.push(ContractCall {
        to: router,
        value,
        data: swap_data(signature, &amounts, &trade.path, recipient, deadline),
    });

    calls
}

// Method choice by (direction, side, feeOnTransfer). Exact-out has no
// fee-on-transfer variants.
fn method_signature(
    trade_type: TradeType,
    ether_in: bool,
    ether_out: bool,
    fee_on_transfer: bool,
) -> &'static str {
    match (trade_type, ether_in, ether_out, fee_on_transfer) {
        (TradeType::ExactIn, true, _, false) => {
            "swapExactETHForTokens(uint256,address[],address,uint256)"
        }
        (TradeType::ExactIn, true, _, true) => {
            "swapExactETHForTokensSupportingFeeOnTransferTokens(uint256,address[],address,uint256)"
        }
        (TradeType::ExactIn, false, true, false) => {
            "swapExactTokensForETH(uint256,uint256,address[],address,uint256)"
        }
        (TradeType::ExactIn, false, true, true) => {
            "swapExactTokensForETHSupportingFeeOnTransferTokens(uint256,uint256,address[],address,uint256)"
        }
        (TradeType::ExactIn, false, false, false) => {
            "swapExactTokensForTokens(uint256,uint256,address[],address,uint256)"
        }
        (TradeType::ExactIn, false, false, true) => {
            "swapExactTokensForTokensSupportingFeeOnTransferTokens(uint256,uint256,address[],address,uint256)"
        }
        (TradeType::ExactOut, true, _, _) => {
            "swapETHForExactTokens(uint256,address[],address,uint256)"
        }
        (TradeType::ExactOut, false, true, _) => {
            "swapTokensForExactETH(uint256,uint256,address[],address,uint256)"
        }
        (TradeType::ExactOut, false, false, _) => {
            "swapTokensForExactTokens(uint256,uint256,address[],address,uint256)"
        }
    }
}

// Head words (amounts, path offset, recipient, deadline), then the path as a
// dynamic array at the tail.
fn swap_data(
    signature: &str,
    amounts: &[&BigUint],
    path: &[Address],
    recipient: &Address,
    deadline: u64,
) -> Vec<u8> {
    let head_words = amounts.len() + 3;
    let mut data = abi_selector(signature).to_vec();
    for amount in amounts {
        data.extend_from_slice(&abi_word_uint(amount));
    }
    data.extend_from_slice(&abi_word_u64((head_words * 32) as u64));
    data.extend_from_slice(&abi_word_address(recipient));
    data.extend_from_slice(&abi_word_u64(deadline));
    data.extend_from_slice(&abi_word_u64(path.len() as u64));
    for token in path {
        data.extend_from_slice(&abi_word_address(token));
    }

    data
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use ember_sync::primitives::Address;

    use crate::uniswap::pair::{Pair, amount_out};
    use crate::utils::abi_selector;

    use super::{
        ContractCall, Trade, TradeType, best_trade, swap_calls, trades_exact_in,
        trades_exact_out,
    };

    fn token(fill: u8) -> Address {
        Address::new([fill; 20])
    }

    fn two_hop_pairs() -> Vec<Pair> {
        vec![
            Pair::new(
                token(0xa),
                BigUint::from(1000u32),
                token(0xb),
                BigUint::from(2000u32),
            ),
            Pair::new(
                token(0xb),
                BigUint::from(5000u32),
                token(0xc),
                BigUint::from(4000u32),
            ),
        ]
    }

    #[test]
    fn exact_in_finds_the_two_hop_route() {
        let pairs = two_hop_pairs();
        let trades = trades_exact_in(
            &pairs,
            token(0xa),
            &BigUint::from(100u32),
            token(0xc),
            3,
        );

        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.path, vec![token(0xa), token(0xb), token(0xc)]);
        let first_leg = amount_out(
            &BigUint::from(100u32),
            &BigUint::from(1000u32),
            &BigUint::from(2000u32),
        );
        assert_eq!(
            trade.amount_out,
            amount_out(&first_leg, &BigUint::from(5000u32), &BigUint::from(4000u32))
        );
    }

    #[test]
    fn hop_bound_prunes_long_routes() {
        let pairs = two_hop_pairs();
        assert!(
            trades_exact_in(&pairs, token(0xa), &BigUint::from(100u32), token(0xc), 1)
                .is_empty()
        );
    }

    #[test]
    fn exact_out_mirrors_the_route() {
        let pairs = two_hop_pairs();
        let trades = trades_exact_out(&pairs, token(0xa), token(0xc), &BigUint::from(100u32), 3);

        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.path, vec![token(0xa), token(0xb), token(0xc)]);
        assert_eq!(trade.amount_out, BigUint::from(100u32));
        // the computed input must actually buy the requested output
        let first_leg = amount_out(
            &trade.amount_in,
            &BigUint::from(1000u32),
            &BigUint::from(2000u32),
        );
        let bought = amount_out(&first_leg, &BigUint::from(5000u32), &BigUint::from(4000u32));
        assert!(bought >= trade.amount_out);
    }

    #[test]
    fn best_trade_prefers_output_then_shorter_path() {
        let better = Trade {
            trade_type: TradeType::ExactIn,
            path: vec![token(1), token(2), token(3)],
            amount_in: BigUint::from(100u32),
            amount_out: BigUint::from(200u32),
        };
        let shorter_same_output = Trade {
            trade_type: TradeType::ExactIn,
            path: vec![token(1), token(3)],
            amount_in: BigUint::from(100u32),
            amount_out: BigUint::from(200u32),
        };
        let worse = Trade {
            trade_type: TradeType::ExactIn,
            path: vec![token(1), token(3)],
            amount_in: BigUint::from(100u32),
            amount_out: BigUint::from(150u32),
        };

        let best = best_trade(vec![better, shorter_same_output.clone(), worse]).unwrap();
        assert_eq!(best, shorter_same_output);
    }

    fn ether_in_trade() -> Trade {
        Trade {
            trade_type: TradeType::ExactIn,
            path: vec![token(0xee), token(0xcc)],
            amount_in: BigUint::from(1_000u32),
            amount_out: BigUint::from(500u32),
        }
    }

    #[test]
    fn ether_source_needs_no_approve_and_carries_value() {
        let calls = swap_calls(
            &ether_in_trade(),
            true,
            false,
            false,
            &BigUint::from(490u32),
            &token(0x99),
            1_700_000_000,
            token(0x77),
        );

        assert_eq!(calls.len(), 1);
        let swap = &calls[0];
        assert_eq!(swap.to, token(0x77));
        assert_eq!(swap.value, BigUint::from(1_000u32));
        assert_eq!(
            &swap.data[..4],
            &abi_selector("swapExactETHForTokens(uint256,address[],address,uint256)")
        );
    }

    #[test]
    fn token_source_is_preceded_by_approve() {
        let trade = Trade {
            trade_type: TradeType::ExactIn,
            path: vec![token(0xaa), token(0xbb)],
            amount_in: BigUint::from(1_000u32),
            amount_out: BigUint::from(500u32),
        };
        let calls = swap_calls(
            &trade,
            false,
            false,
            false,
            &BigUint::from(490u32),
            &token(0x99),
            1_700_000_000,
            token(0x77),
        );

        assert_eq!(calls.len(), 2);
        let ContractCall { to, data, .. } = &calls[0];
        assert_eq!(*to, token(0xaa));
        assert_eq!(&data[..4], &abi_selector("approve(address,uint256)"));

        let swap = &calls[1];
        assert_eq!(
            &swap.data[..4],
            &abi_selector("swapExactTokensForTokens(uint256,uint256,address[],address,uint256)")
        );
        // head: amountIn, amountOutMin, offset(0xa0), to, deadline
        assert_eq!(
            swap.data[4..36],
            crate::utils::abi_word_uint(&BigUint::from(1_000u32))
        );
        assert_eq!(
            swap.data[36..68],
            crate::utils::abi_word_uint(&BigUint::from(490u32))
        );
        assert_eq!(swap.data[68..100], crate::utils::abi_word_u64(0xa0));
        // tail: path length then the two hops
        assert_eq!(swap.data[164..196], crate::utils::abi_word_u64(2));
    }

    #[test]
    fn fee_on_transfer_selects_supporting_variant() {
        let calls = swap_calls(
            &ether_in_trade(),
            true,
            false,
            true,
            &BigUint::from(490u32),
            &token(0x99),
            1_700_000_000,
            token(0x77),
        );
        assert_eq!(
            &calls[0].data[..4],
            &abi_selector(
                "swapExactETHForTokensSupportingFeeOnTransferTokens(uint256,address[],address,uint256)"
            )
        );
    }
}
