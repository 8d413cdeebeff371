//! Multi-protocol swap router.
//!
//! Dispatches on the pair's protocol generation:
//! - **V2** — fee-on-transfer-aware swapper proxy, output read from the last
//!   `Transfer` log to the owner.
//! - **V3** — single-hop `exactInputSingle` against the Uniswap router
//!   (fee-addressed) or the Aerodrome Slipstream router (tick-spacing
//!   addressed); output read from the pool's `Swap` event, whose amounts are
//!   signed two's-complement int256.
//! - **V4** — Universal Router `V4_SWAP` command carrying
//!   SWAP_EXACT_IN_SINGLE / SETTLE_ALL / TAKE_ALL actions over the canonical
//!   (sorted) currency pair; output read from the last `Transfer` to the
//!   owner with the V3 `Swap` parse as fallback.
//!
//! `is_token0_in` always describes the *buy* direction from the base token;
//! sells invert it. Every path surfaces failures as `Err`, never a panic.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, I256, U256};
use alloy::rpc::types::{Log, TransactionReceipt};
use alloy::sol_types::{SolCall, SolValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{
    default_tick_spacing, AERODROME_CL_ROUTER, GAS_LIMIT_V2_SWAP, GAS_LIMIT_V3_SWAP,
    GAS_LIMIT_V4_SWAP, PERMIT2, TOPIC_TRANSFER, TOPIC_V3_SWAP, UNISWAP_V3_ROUTER,
    UNIVERSAL_ROUTER, UR_CMD_V4_SWAP, V3_SWAP_DEADLINE_SECS, V4_ACTION_SETTLE_ALL,
    V4_ACTION_SWAP_EXACT_IN_SINGLE, V4_ACTION_TAKE_ALL, V4_SWAP_DEADLINE_SECS,
};
use crate::errors::AgentError;
use crate::execution::chain::{ChainClient, TxSpec};
use crate::execution::contracts::{
    IAerodromeClRouter, ISwapperProxy, IUniswapV3Router, IUniversalRouter, IV3Pool, PoolKey,
    V4ExactInputSingleParams,
};
use crate::types::{PairState, Protocol};

/// Buy spends the base token; sell spends the held token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapAction {
    Buy,
    Sell,
}

/// Result of a confirmed swap.
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub amount_out_raw: U256,
    pub readable_out: f64,
}

pub struct SwapRouter {
    chain: Arc<ChainClient>,
    v2_swapper: Address,
    /// Write-once tick-spacing cache for Aerodrome pools.
    tick_spacing_cache: Mutex<HashMap<Address, i32>>,
}

impl SwapRouter {
    pub fn new(chain: Arc<ChainClient>, v2_swapper: Address) -> Self {
        Self {
            chain,
            v2_swapper,
            tick_spacing_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The contract that must hold an ERC-20 approval for this pair's swaps.
    pub fn spender_for(&self, pair: &PairState) -> Address {
        match pair.protocol {
            Protocol::V2 => self.v2_swapper,
            Protocol::V3 => {
                if pair.fork == "aerodrome" {
                    AERODROME_CL_ROUTER
                } else {
                    UNISWAP_V3_ROUTER
                }
            }
            Protocol::V4 => PERMIT2,
        }
    }

    /// Execute a swap on `pair` and parse the realized output.
    pub async fn perform_swap(
        &self,
        pair: &PairState,
        amount_in: U256,
        is_token0_in: bool,
        min_amount_out: U256,
        action: SwapAction,
    ) -> Result<SwapOutcome, AgentError> {
        // `is_token0_in` is the buy direction; a sell swaps the other way.
        let token0_in = match action {
            SwapAction::Buy => is_token0_in,
            SwapAction::Sell => !is_token0_in,
        };
        let (token_in, token_out, out_decimals) = if token0_in {
            (pair.token0, pair.token1, pair.token1_decimals)
        } else {
            (pair.token1, pair.token0, pair.token0_decimals)
        };

        debug!(
            pair = %pair.pair_address,
            protocol = pair.protocol.as_str(),
            %token_in,
            %token_out,
            amount_in = %amount_in,
            action = ?action,
            "dispatching swap"
        );

        let receipt = match pair.protocol {
            Protocol::V2 => self.swap_v2(pair, amount_in, min_amount_out, token0_in, action).await,
            Protocol::V3 => {
                self.swap_v3(pair, token_in, token_out, amount_in, min_amount_out)
                    .await
            }
            Protocol::V4 => {
                self.swap_v4(pair, token_in, token_out, amount_in, min_amount_out)
                    .await
            }
        }
        .map_err(|e| AgentError::Swap {
            reason: format!("{} swap on {}: {e}", pair.protocol.as_str(), pair.pair_address),
        })?;

        let logs = receipt.inner.logs();
        let amount_out_raw = match pair.protocol {
            Protocol::V2 => last_transfer_to(logs, self.chain.owner()),
            Protocol::V3 => v3_swap_amount_out(logs, token0_in),
            Protocol::V4 => last_transfer_to(logs, self.chain.owner())
                .or_else(|| v3_swap_amount_out(logs, token0_in)),
        }
        .ok_or_else(|| AgentError::Swap {
            reason: format!(
                "no output log found in receipt for {} swap on {}",
                pair.protocol.as_str(),
                pair.pair_address
            ),
        })?;

        let readable_out = raw_to_readable(amount_out_raw, out_decimals);
        info!(
            pair = %pair.pair_address,
            amount_out = %amount_out_raw,
            readable_out,
            "swap confirmed"
        );

        Ok(SwapOutcome {
            amount_out_raw,
            readable_out,
        })
    }

    // -----------------------------------------------------------------------
    // V2
    // -----------------------------------------------------------------------

    async fn swap_v2(
        &self,
        pair: &PairState,
        amount_in: U256,
        min_out: U256,
        token0_in: bool,
        action: SwapAction,
    ) -> Result<TransactionReceipt, AgentError> {
        let tax = match action {
            SwapAction::Buy => pair.buy_tax,
            SwapAction::Sell => pair.sell_tax,
        };
        let tax_bps = U256::from(tax.round().max(0.0) as u64);

        let input = ISwapperProxy::swapCall {
            pair: pair.pair_address,
            amountIn: amount_in,
            minOut: min_out,
            zeroForOne: token0_in,
            taxBps: tax_bps,
        }
        .abi_encode();

        self.chain
            .submit(&TxSpec {
                to: self.v2_swapper,
                input: Bytes::from(input),
                value: U256::ZERO,
                gas_limit: GAS_LIMIT_V2_SWAP,
            })
            .await
    }

    // -----------------------------------------------------------------------
    // V3
    // -----------------------------------------------------------------------

    async fn swap_v3(
        &self,
        pair: &PairState,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        min_out: U256,
    ) -> Result<TransactionReceipt, AgentError> {
        let deadline = U256::from(chrono::Utc::now().timestamp() as u64 + V3_SWAP_DEADLINE_SECS);
        let recipient = self.chain.owner();

        let (router, input) = if pair.fork == "aerodrome" {
            let tick_spacing = self.pool_tick_spacing(pair).await?;
            let params = IAerodromeClRouter::ExactInputSingleParams {
                tokenIn: token_in,
                tokenOut: token_out,
                tickSpacing: alloy::primitives::aliases::I24::try_from(tick_spacing)
                    .unwrap_or_default(),
                recipient,
                deadline,
                amountIn: amount_in,
                amountOutMinimum: min_out,
                sqrtPriceLimitX96: alloy::primitives::aliases::U160::ZERO,
            };
            (
                AERODROME_CL_ROUTER,
                IAerodromeClRouter::exactInputSingleCall { params }.abi_encode(),
            )
        } else {
            let params = IUniswapV3Router::ExactInputSingleParams {
                tokenIn: token_in,
                tokenOut: token_out,
                fee: alloy::primitives::aliases::U24::from(fee_to_pips(pair.fee)),
                recipient,
                deadline,
                amountIn: amount_in,
                amountOutMinimum: min_out,
                sqrtPriceLimitX96: alloy::primitives::aliases::U160::ZERO,
            };
            (
                UNISWAP_V3_ROUTER,
                IUniswapV3Router::exactInputSingleCall { params }.abi_encode(),
            )
        };

        self.chain
            .submit(&TxSpec {
                to: router,
                input: Bytes::from(input),
                value: U256::ZERO,
                gas_limit: GAS_LIMIT_V3_SWAP,
            })
            .await
    }

    /// Tick spacing for an Aerodrome pool: feed value if present, otherwise
    /// queried once from the pool contract and cached.
    async fn pool_tick_spacing(&self, pair: &PairState) -> Result<i32, AgentError> {
        if let Some(spacing) = pair.tick_spacing {
            return Ok(spacing);
        }
        let mut cache = self.tick_spacing_cache.lock().await;
        if let Some(&spacing) = cache.get(&pair.pair_address) {
            return Ok(spacing);
        }
        let pool = IV3Pool::new(pair.pair_address, self.chain.provider().clone());
        let spacing: i32 = pool.tickSpacing().call().await?.as_i32();
        cache.insert(pair.pair_address, spacing);
        debug!(pair = %pair.pair_address, spacing, "tick spacing cached");
        Ok(spacing)
    }

    // -----------------------------------------------------------------------
    // V4
    // -----------------------------------------------------------------------

    async fn swap_v4(
        &self,
        pair: &PairState,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        min_out: U256,
    ) -> Result<TransactionReceipt, AgentError> {
        let input = encode_v4_execute(pair, token_in, token_out, amount_in, min_out);

        // Pre-submit simulation. A failure here is informational only; the
        // transaction is still submitted.
        if let Err(e) = self
            .chain
            .static_call(UNIVERSAL_ROUTER, input.clone())
            .await
        {
            warn!(
                pair = %pair.pair_address,
                error = %e,
                "v4 simulation failed, submitting anyway"
            );
        }

        self.chain
            .submit(&TxSpec {
                to: UNIVERSAL_ROUTER,
                input,
                value: U256::ZERO,
                gas_limit: GAS_LIMIT_V4_SWAP,
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Fee fraction-of-a-percent → pips (`0.3` → `3000`).
pub fn fee_to_pips(fee: f64) -> u32 {
    (fee * 10_000.0).round().max(0.0) as u32
}

/// Build the full Universal Router `execute` calldata for a single-hop V4
/// exact-in swap.
pub fn encode_v4_execute(
    pair: &PairState,
    token_in: Address,
    token_out: Address,
    amount_in: U256,
    min_out: U256,
) -> Bytes {
    let fee_pips = fee_to_pips(pair.fee);
    let tick_spacing = pair
        .tick_spacing
        .unwrap_or_else(|| default_tick_spacing(fee_pips));

    // V4 pools are keyed by the sorted currency pair.
    let (currency0, currency1) = if token_in < token_out {
        (token_in, token_out)
    } else {
        (token_out, token_in)
    };
    let zero_for_one = token_in == currency0;

    let pool_key = PoolKey {
        currency0,
        currency1,
        fee: alloy::primitives::aliases::U24::from(fee_pips),
        tickSpacing: alloy::primitives::aliases::I24::try_from(tick_spacing).unwrap_or_default(),
        hooks: pair.hooks.unwrap_or(Address::ZERO),
    };

    let swap_params = V4ExactInputSingleParams {
        poolKey: pool_key,
        zeroForOne: zero_for_one,
        amountIn: amount_in.to::<u128>(),
        amountOutMinimum: min_out.to::<u128>(),
        hookData: Bytes::new(),
    };

    let actions = Bytes::from(vec![
        V4_ACTION_SWAP_EXACT_IN_SINGLE,
        V4_ACTION_SETTLE_ALL,
        V4_ACTION_TAKE_ALL,
    ]);
    let params: Vec<Bytes> = vec![
        Bytes::from(swap_params.abi_encode()),
        Bytes::from((token_in, amount_in).abi_encode_params()),
        Bytes::from((token_out, min_out).abi_encode_params()),
    ];
    let v4_input = Bytes::from((actions, params).abi_encode_params());

    let deadline = U256::from(chrono::Utc::now().timestamp() as u64 + V4_SWAP_DEADLINE_SECS);
    let call = IUniversalRouter::executeCall {
        commands: Bytes::from(vec![UR_CMD_V4_SWAP]),
        inputs: vec![v4_input],
        deadline,
    };
    Bytes::from(call.abi_encode())
}

// ---------------------------------------------------------------------------
// Receipt parsing
// ---------------------------------------------------------------------------

/// Value of the last `Transfer(_, owner, value)` log in the receipt.
pub fn last_transfer_to(logs: &[Log], owner: Address) -> Option<U256> {
    logs.iter().rev().find_map(|log| {
        let topics = log.inner.data.topics();
        if topics.len() == 3
            && topics[0] == TOPIC_TRANSFER
            && Address::from_word(topics[2]) == owner
        {
            Some(U256::from_be_slice(log.inner.data.data.as_ref()))
        } else {
            None
        }
    })
}

/// Output amount from the last V3 pool `Swap` event in the receipt.
pub fn v3_swap_amount_out(logs: &[Log], token0_in: bool) -> Option<U256> {
    logs.iter().rev().find_map(|log| {
        let topics = log.inner.data.topics();
        let data = log.inner.data.data.as_ref();
        if topics.first() == Some(&TOPIC_V3_SWAP) && data.len() >= 64 {
            let amount0 = I256::from_raw(U256::from_be_slice(&data[0..32]));
            let amount1 = I256::from_raw(U256::from_be_slice(&data[32..64]));
            Some(v3_amount_out(amount0, amount1, token0_in))
        } else {
            None
        }
    })
}

/// The pool reports signed deltas from its own perspective; the output side
/// is the negative one. `|amount1|` when token0 went in, else `|amount0|`.
pub fn v3_amount_out(amount0: I256, amount1: I256, token0_in: bool) -> U256 {
    if token0_in {
        amount1.unsigned_abs()
    } else {
        amount0.unsigned_abs()
    }
}

// ---------------------------------------------------------------------------
// Amount conversions
// ---------------------------------------------------------------------------

/// Raw integer amount → human-readable float.
pub fn raw_to_readable(raw: U256, decimals: u8) -> f64 {
    let v: f64 = raw.to_string().parse().unwrap_or(f64::MAX);
    v / 10f64.powi(decimals as i32)
}

/// Readable ETH amount → wei. Non-positive inputs yield zero.
pub fn eth_to_wei(amount: f64) -> U256 {
    if amount <= 0.0 || !amount.is_finite() {
        return U256::ZERO;
    }
    U256::from((amount * 1e18).round() as u128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, LogData, B256};

    fn log(topics: Vec<B256>, data: Vec<u8>) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data: LogData::new_unchecked(topics, data.into()),
            },
            ..Default::default()
        }
    }

    fn transfer_log(to: Address, value: u64) -> Log {
        let mut data = [0u8; 32];
        data[24..].copy_from_slice(&value.to_be_bytes());
        log(
            vec![TOPIC_TRANSFER, B256::ZERO, to.into_word()],
            data.to_vec(),
        )
    }

    // -- transfer parsing ----------------------------------------------------

    #[test]
    fn last_transfer_to_owner_wins() {
        let owner = address!("00000000000000000000000000000000000000aa");
        let other = address!("00000000000000000000000000000000000000bb");
        let logs = vec![
            transfer_log(owner, 100),
            transfer_log(other, 500),
            transfer_log(owner, 250),
        ];
        assert_eq!(last_transfer_to(&logs, owner), Some(U256::from(250)));
    }

    #[test]
    fn no_transfer_to_owner_is_none() {
        let owner = address!("00000000000000000000000000000000000000aa");
        let other = address!("00000000000000000000000000000000000000bb");
        let logs = vec![transfer_log(other, 500)];
        assert_eq!(last_transfer_to(&logs, owner), None);
    }

    // -- v3 swap parsing -----------------------------------------------------

    #[test]
    fn v3_amount_out_two_complement_round_trip() {
        // token0 in: amount0 positive (paid in), amount1 negative (received).
        let amount0 = I256::try_from(1_000_000i64).unwrap();
        let amount1 = I256::try_from(-42_000i64).unwrap();
        assert_eq!(v3_amount_out(amount0, amount1, true), U256::from(42_000));
        // token1 in: output is |amount0|.
        let amount0 = I256::try_from(-7i64).unwrap();
        let amount1 = I256::try_from(9i64).unwrap();
        assert_eq!(v3_amount_out(amount0, amount1, false), U256::from(7));
    }

    #[test]
    fn v3_swap_log_parse() {
        let amount0 = I256::try_from(500i64).unwrap();
        let amount1 = I256::try_from(-125i64).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&amount0.to_be_bytes::<32>());
        data.extend_from_slice(&amount1.to_be_bytes::<32>());
        // sqrtPriceX96 + liquidity + tick padding
        data.extend_from_slice(&[0u8; 96]);
        let logs = vec![log(vec![TOPIC_V3_SWAP, B256::ZERO, B256::ZERO], data)];
        assert_eq!(v3_swap_amount_out(&logs, true), Some(U256::from(125)));
        assert_eq!(v3_swap_amount_out(&logs, false), Some(U256::from(500)));
    }

    // -- conversions ---------------------------------------------------------

    #[test]
    fn readable_conversion() {
        let raw = U256::from(1_500_000_000_000_000_000u128);
        assert!((raw_to_readable(raw, 18) - 1.5).abs() < 1e-12);
        assert!((raw_to_readable(U256::from(2500u64), 2) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn wei_conversion() {
        assert_eq!(eth_to_wei(0.01), U256::from(10_000_000_000_000_000u128));
        assert_eq!(eth_to_wei(0.0), U256::ZERO);
        assert_eq!(eth_to_wei(-1.0), U256::ZERO);
        assert_eq!(eth_to_wei(f64::NAN), U256::ZERO);
    }

    // -- v4 encoding ---------------------------------------------------------

    fn v4_pair() -> crate::types::PairState {
        use crate::types::{FeedEvent, Protocol};
        let event = FeedEvent {
            pair_address: address!("00000000000000000000000000000000000000cc"),
            chain_tag: "base_v4".into(),
            last_price: 1.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            liquidity: 10.0,
            minute_key: 100,
            token0: address!("4200000000000000000000000000000000000006"),
            token1: address!("00000000000000000000000000000000000000bb"),
            token0_decimals: 18,
            token1_decimals: 18,
            protocol: Protocol::V4,
            fork: "uniswap".into(),
            fee: 0.3,
            tick_spacing: None,
            hooks: None,
            symbol: "TKN".into(),
            name: "Token".into(),
            buy_tax: 0.0,
            sell_tax: 0.0,
        };
        crate::types::PairState::from_event(&event, 0)
    }

    #[test]
    fn v4_execute_calldata_has_selector_and_command() {
        use alloy::sol_types::SolCall;
        let pair = v4_pair();
        let calldata = encode_v4_execute(
            &pair,
            pair.token1,
            pair.token0,
            U256::from(1000u64),
            U256::ZERO,
        );
        assert_eq!(&calldata[..4], IUniversalRouter::executeCall::SELECTOR);
        let decoded = IUniversalRouter::executeCall::abi_decode(&calldata).unwrap();
        assert_eq!(decoded.commands.as_ref(), &[UR_CMD_V4_SWAP]);
        assert_eq!(decoded.inputs.len(), 1);
    }

    #[test]
    fn v4_zero_for_one_follows_canonical_order() {
        let pair = v4_pair();
        // token0 (0x4200…) > token1 (0x0000…bb), so canonical currency0 is token1.
        let calldata =
            encode_v4_execute(&pair, pair.token1, pair.token0, U256::from(1u64), U256::ZERO);
        let decoded = IUniversalRouter::executeCall::abi_decode(&calldata).unwrap();
        let (actions, params): (Bytes, Vec<Bytes>) =
            <(Bytes, Vec<Bytes>)>::abi_decode_params(&decoded.inputs[0]).unwrap();
        assert_eq!(
            actions.as_ref(),
            &[
                V4_ACTION_SWAP_EXACT_IN_SINGLE,
                V4_ACTION_SETTLE_ALL,
                V4_ACTION_TAKE_ALL
            ]
        );
        let swap = V4ExactInputSingleParams::abi_decode(&params[0]).unwrap();
        // Spending token1, the canonical currency0 → zeroForOne.
        assert!(swap.zeroForOne);
        assert_eq!(swap.poolKey.currency0, pair.token1);
        assert_eq!(swap.poolKey.currency1, pair.token0);
        // 0.3% pool with no explicit spacing gets the standard 60.
        assert_eq!(swap.poolKey.tickSpacing.as_i32(), 60);
    }

    #[test]
    fn fee_pips_conversion() {
        assert_eq!(fee_to_pips(0.3), 3000);
        assert_eq!(fee_to_pips(0.05), 500);
        assert_eq!(fee_to_pips(1.0), 10000);
        assert_eq!(fee_to_pips(0.01), 100);
    }
}
