//! Chain addresses, event topics, gas limits, and fee-policy numbers for
//! Base mainnet.

use alloy::primitives::{address, b256, Address, B256};

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

pub const CHAIN_ID_BASE: u64 = 8453;

pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";

/// Feed chain tags subscribed to when the config does not override them.
pub const DEFAULT_CHAIN_TAGS: [&str; 2] = ["base_v3", "base_v4"];

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

pub const WETH: Address = address!("4200000000000000000000000000000000000006");
pub const ZORA: Address = address!("1111111111166b7fe7bd91427724b487980afc69");
pub const CLANKER: Address = address!("1bc0c42215582d5a085795f4badbac3ff36d1bcb");

/// USD rate keys kept from `usdRates_update` events; everything else in the
/// payload is ignored.
pub const TRACKED_RATE_ASSETS: [&str; 4] = ["ETH", "WETH", "ZORA", "CLANKER"];

// ---------------------------------------------------------------------------
// Routers and approval targets
// ---------------------------------------------------------------------------

pub const PERMIT2: Address = address!("000000000022d473030f116ddee9f6b43ac78ba3");
pub const UNIVERSAL_ROUTER: Address = address!("6ff5693b99212da76ad316178a184ab56d299b43");
pub const UNISWAP_V3_ROUTER: Address = address!("2626664c2603336e57b271c5c0b26f421741e481");
pub const AERODROME_CL_ROUTER: Address = address!("be6d8f0d05cc4be24d5167a3ef062215be6d18a5");

/// Default address of the fee-on-transfer-aware V2 swapper proxy; overridable
/// via the `v2_swapper` config field.
pub const DEFAULT_V2_SWAPPER: Address = address!("94cc0aefbe3e989d675c2aa834548dc97e3e4b3a");

// ---------------------------------------------------------------------------
// Event topics
// ---------------------------------------------------------------------------

/// `keccak256("Transfer(address,address,uint256)")`
pub const TOPIC_TRANSFER: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// `keccak256("Swap(address,address,int256,int256,uint160,uint128,int24)")`
/// — the Uniswap V3 pool swap event.
pub const TOPIC_V3_SWAP: B256 =
    b256!("c42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67");

// ---------------------------------------------------------------------------
// Universal Router / V4 encoding
// ---------------------------------------------------------------------------

/// Universal Router command byte for a V4 swap batch.
pub const UR_CMD_V4_SWAP: u8 = 0x10;

// V4 action bytes, executed in order inside the V4_SWAP input.
pub const V4_ACTION_SWAP_EXACT_IN_SINGLE: u8 = 0x06;
pub const V4_ACTION_SETTLE_ALL: u8 = 0x0c;
pub const V4_ACTION_TAKE_ALL: u8 = 0x0f;

/// Standard fee-tier → tick-spacing mapping for V4 pools without an explicit
/// spacing from the feed. Unknown tiers fall back to 60.
pub fn default_tick_spacing(fee_pips: u32) -> i32 {
    match fee_pips {
        100 => 1,
        500 => 10,
        3000 => 60,
        10000 => 200,
        _ => 60,
    }
}

// ---------------------------------------------------------------------------
// Gas and fees
// ---------------------------------------------------------------------------

pub const GAS_LIMIT_V2_SWAP: u64 = 300_000;
pub const GAS_LIMIT_V3_SWAP: u64 = 800_000;
pub const GAS_LIMIT_V4_SWAP: u64 = 800_000;
pub const GAS_LIMIT_APPROVAL: u64 = 100_000;

pub const V3_SWAP_DEADLINE_SECS: u64 = 30;
pub const V4_SWAP_DEADLINE_SECS: u64 = 60;

/// Fee suggestion floor for the priority fee: 0.01 gwei.
pub const MIN_PRIORITY_FEE_WEI: u128 = 10_000_000;

/// Headroom multiplier applied to both fee components.
pub const FEE_HEADROOM: f64 = 1.01;

/// Fallback fees used when the RPC refuses to quote: 0.05 / 0.001 gwei.
pub const FALLBACK_MAX_FEE_WEI: u128 = 50_000_000;
pub const FALLBACK_PRIORITY_FEE_WEI: u128 = 1_000_000;

// ---------------------------------------------------------------------------
// Timers and retention
// ---------------------------------------------------------------------------

pub const GAS_REFRESH_INTERVAL_SECS: u64 = 30;
pub const CLEANUP_INTERVAL_SECS: u64 = 15 * 60;
pub const RECONCILE_INTERVAL_SECS: u64 = 5 * 60;
pub const SNAPSHOT_INTERVAL_SECS: u64 = 60;

/// Pairs with no feed update for this long and no open trade are evicted.
pub const PAIR_IDLE_EVICT_SECS: u64 = 30 * 60;

/// Permit2 approvals are granted for this long.
pub const PERMIT2_EXPIRY_SECS: u64 = 30 * 24 * 60 * 60;
