//! Market-data types: normalized feed events, per-pair rolling state, and
//! the time-window groups policies evaluate against.

use std::collections::BTreeMap;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// DEX pool protocol generation. Decides router family, calldata encoding,
/// and receipt parsing in the swap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    V2,
    V3,
    V4,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2 => "v2",
            Self::V3 => "v3",
            Self::V4 => "v4",
        }
    }
}

/// A trade aggregate pushed by the feed, normalized from the wire shape.
///
/// The wire payload is heterogeneous (nested or flat, camelCase or
/// snake_case); `core::aggregator::normalize_event` produces this.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub pair_address: Address,
    pub chain_tag: String,
    pub last_price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub liquidity: f64,
    pub minute_key: i64,
    pub token0: Address,
    pub token1: Address,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    pub protocol: Protocol,
    pub fork: String,
    /// Fee as a fraction of a percent, e.g. `0.3` for a 0.3% pool.
    pub fee: f64,
    pub tick_spacing: Option<i32>,
    pub hooks: Option<Address>,
    pub symbol: String,
    pub name: String,
    pub buy_tax: f64,
    pub sell_tax: f64,
}

/// One OHLCV-style window per pair per group key.
///
/// `group_key = floor(minute_key / group_interval) * group_interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub first_price: f64,
    pub last_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub price_change: f64,
    pub price_change_pct: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub total_volume: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    /// `total_volume / liquidity * 100` at the latest update.
    pub volatility: f64,
}

impl Group {
    /// Seed a fresh window. `first_price` is set exactly once, here.
    pub fn seed(price: f64) -> Self {
        Self {
            first_price: price,
            last_price: price,
            min_price: price,
            max_price: price,
            price_change: 0.0,
            price_change_pct: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            total_volume: 0.0,
            buy_count: 0,
            sell_count: 0,
            volatility: 0.0,
        }
    }

    /// Fold one feed event into the window.
    pub fn apply(&mut self, event: &FeedEvent) {
        self.last_price = event.last_price;
        self.min_price = self.min_price.min(event.last_price);
        self.max_price = self.max_price.max(event.last_price);
        self.buy_volume += event.buy_volume;
        self.sell_volume += event.sell_volume;
        self.total_volume = self.buy_volume + self.sell_volume;
        if event.buy_volume > 0.0 {
            self.buy_count += 1;
        }
        if event.sell_volume > 0.0 {
            self.sell_count += 1;
        }
        self.price_change = self.last_price - self.first_price;
        self.price_change_pct = if self.first_price > 0.0 {
            self.price_change / self.first_price * 100.0
        } else {
            0.0
        };
        self.volatility = if event.liquidity > 0.0 {
            self.total_volume / event.liquidity * 100.0
        } else {
            0.0
        };
    }
}

/// Rolling state for one observed pair.
///
/// Created on the first accepted feed event; evicted by the retention pass
/// once idle with no open trade. Group mutations happen only on the ingest
/// task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairState {
    pub pair_address: Address,
    pub token0: Address,
    pub token1: Address,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    pub protocol: Protocol,
    pub fork: String,
    pub fee: f64,
    pub tick_spacing: Option<i32>,
    pub hooks: Option<Address>,
    pub chain_tag: String,
    pub last_price: f64,
    pub liquidity: f64,
    pub symbol: String,
    pub name: String,
    pub buy_tax: f64,
    pub sell_tax: f64,
    pub last_group_key: i64,
    pub first_seen_ts: i64,
    /// Timestamp (unix secs) of the last accepted feed event; drives eviction.
    pub last_update_ts: i64,
    pub groups: BTreeMap<i64, Group>,
}

impl PairState {
    pub fn from_event(event: &FeedEvent, now_ts: i64) -> Self {
        Self {
            pair_address: event.pair_address,
            token0: event.token0,
            token1: event.token1,
            token0_decimals: event.token0_decimals,
            token1_decimals: event.token1_decimals,
            protocol: event.protocol,
            fork: event.fork.clone(),
            fee: event.fee,
            tick_spacing: event.tick_spacing,
            hooks: event.hooks,
            chain_tag: event.chain_tag.clone(),
            last_price: event.last_price,
            liquidity: event.liquidity,
            symbol: event.symbol.clone(),
            name: event.name.clone(),
            buy_tax: event.buy_tax,
            sell_tax: event.sell_tax,
            last_group_key: 0,
            first_seen_ts: now_ts,
            last_update_ts: now_ts,
            groups: BTreeMap::new(),
        }
    }

    /// Groups oldest → newest, the order policies see them in.
    pub fn groups_ordered(&self) -> Vec<(i64, &Group)> {
        self.groups.iter().map(|(k, g)| (*k, g)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn event(price: f64, buy: f64, sell: f64, liquidity: f64) -> FeedEvent {
        FeedEvent {
            pair_address: address!("00000000000000000000000000000000000000aa"),
            chain_tag: "base_v3".into(),
            last_price: price,
            buy_volume: buy,
            sell_volume: sell,
            liquidity,
            minute_key: 100,
            token0: address!("4200000000000000000000000000000000000006"),
            token1: address!("00000000000000000000000000000000000000bb"),
            token0_decimals: 18,
            token1_decimals: 18,
            protocol: Protocol::V3,
            fork: "uniswap".into(),
            fee: 0.3,
            tick_spacing: None,
            hooks: None,
            symbol: "TKN".into(),
            name: "Token".into(),
            buy_tax: 0.0,
            sell_tax: 0.0,
        }
    }

    #[test]
    fn group_seed_sets_first_price_once() {
        let mut g = Group::seed(1.0);
        assert_eq!(g.first_price, 1.0);
        g.apply(&event(2.0, 1.0, 0.0, 10.0));
        assert_eq!(g.first_price, 1.0);
        assert_eq!(g.last_price, 2.0);
    }

    #[test]
    fn group_price_bounds_hold() {
        let mut g = Group::seed(1.0);
        for p in [1.4, 0.8, 1.1] {
            g.apply(&event(p, 0.5, 0.5, 10.0));
        }
        assert!(g.min_price <= g.first_price && g.first_price <= g.max_price);
        assert!(g.min_price <= g.last_price && g.last_price <= g.max_price);
        assert_eq!(g.min_price, 0.8);
        assert_eq!(g.max_price, 1.4);
    }

    #[test]
    fn group_volume_identity() {
        let mut g = Group::seed(1.0);
        g.apply(&event(1.0, 3.0, 0.0, 10.0));
        g.apply(&event(1.0, 0.0, 2.0, 10.0));
        assert_eq!(g.total_volume, g.buy_volume + g.sell_volume);
        assert_eq!(g.buy_count, 1);
        assert_eq!(g.sell_count, 1);
    }

    #[test]
    fn group_volatility_scales_with_liquidity() {
        let mut g = Group::seed(1.0);
        g.apply(&event(1.0, 5.0, 5.0, 10.0));
        // 10 units of volume over 10 liquidity → 100%
        assert_eq!(g.volatility, 100.0);
    }

    #[test]
    fn group_change_pct() {
        let mut g = Group::seed(1.0);
        g.apply(&event(1.3, 1.0, 0.0, 10.0));
        assert!((g.price_change_pct - 30.0).abs() < 1e-9);
    }
}
