//! Market-data aggregation: normalizes noisy feed payloads and folds them
//! into per-pair rolling group windows.
//!
//! The feed emits both nested (`{data: {…}}`) and flat shapes, with field
//! names in either camelCase or snake_case. The extractor walks every
//! candidate before giving up on a field.
//!
//! `PairBook` mutations happen only on the ingest task; the retention pass
//! runs on a timer and takes the same write lock.

use std::collections::HashMap;

use alloy::primitives::Address;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::types::{FeedEvent, Group, PairState, Protocol};

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Find a field by any of its candidate names, preferring the nested `data`
/// body over the envelope.
fn field<'a>(body: &'a Value, root: &'a Value, names: &[&str]) -> Option<&'a Value> {
    for source in [body, root] {
        for name in names {
            if let Some(v) = source.get(name) {
                if !v.is_null() {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn f64_field(body: &Value, root: &Value, names: &[&str]) -> Option<f64> {
    field(body, root, names).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn i64_field(body: &Value, root: &Value, names: &[&str]) -> Option<i64> {
    field(body, root, names).and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn str_field(body: &Value, root: &Value, names: &[&str]) -> Option<String> {
    field(body, root, names)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn addr_field(body: &Value, root: &Value, names: &[&str]) -> Option<Address> {
    str_field(body, root, names).and_then(|s| s.trim().parse().ok())
}

/// Normalize one `marketData` payload. Events with a missing pair address
/// or a non-positive price are dropped.
pub fn normalize_event(raw: &Value) -> Option<FeedEvent> {
    let body = raw.get("data").unwrap_or(raw);

    let pair_address = addr_field(body, raw, &["pairAddress", "pair_address", "pair", "address"])?;
    let last_price = f64_field(body, raw, &["lastPrice", "last_price", "price"])?;
    if last_price <= 0.0 || !last_price.is_finite() {
        return None;
    }

    let chain_tag = str_field(body, raw, &["chain", "chainTag", "chain_tag"]).unwrap_or_default();
    let protocol = protocol_of(body, raw, &chain_tag);

    let minute_key = i64_field(body, raw, &["minuteKey", "minute_key"])
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() / 60_000);

    Some(FeedEvent {
        pair_address,
        chain_tag,
        last_price,
        buy_volume: f64_field(body, raw, &["buyVolume", "buy_volume"]).unwrap_or(0.0),
        sell_volume: f64_field(body, raw, &["sellVolume", "sell_volume"]).unwrap_or(0.0),
        liquidity: f64_field(body, raw, &["liquidity"]).unwrap_or(0.0),
        minute_key,
        token0: addr_field(body, raw, &["token0", "token0Address", "token0_address"])
            .unwrap_or(Address::ZERO),
        token1: addr_field(body, raw, &["token1", "token1Address", "token1_address"])
            .unwrap_or(Address::ZERO),
        token0_decimals: f64_field(body, raw, &["token0Decimals", "token0_decimals"])
            .map(|d| d as u8)
            .unwrap_or(18),
        token1_decimals: f64_field(body, raw, &["token1Decimals", "token1_decimals"])
            .map(|d| d as u8)
            .unwrap_or(18),
        protocol,
        fork: str_field(body, raw, &["fork", "dex"]).unwrap_or_else(|| "uniswap".into()),
        fee: f64_field(body, raw, &["fee", "feeBps", "fee_bps"]).unwrap_or(0.3),
        tick_spacing: i64_field(body, raw, &["tickSpacing", "tick_spacing"]).map(|t| t as i32),
        hooks: addr_field(body, raw, &["hooks"]),
        symbol: str_field(body, raw, &["symbol"]).unwrap_or_default(),
        name: str_field(body, raw, &["name"]).unwrap_or_default(),
        buy_tax: f64_field(body, raw, &["buyTax", "buy_tax"]).unwrap_or(0.0),
        sell_tax: f64_field(body, raw, &["sellTax", "sell_tax"]).unwrap_or(0.0),
    })
}

fn protocol_of(body: &Value, root: &Value, chain_tag: &str) -> Protocol {
    if let Some(p) = str_field(body, root, &["protocol", "version"]) {
        match p.to_lowercase().as_str() {
            "v2" | "2" => return Protocol::V2,
            "v3" | "3" => return Protocol::V3,
            "v4" | "4" => return Protocol::V4,
            _ => {}
        }
    }
    if chain_tag.ends_with("_v2") {
        Protocol::V2
    } else if chain_tag.ends_with("_v4") {
        Protocol::V4
    } else {
        Protocol::V3
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Pair allow/deny filtering from config.
pub fn passes_filters(config: &Config, pair: Address) -> bool {
    let matches = |list: &[String]| {
        list.iter()
            .any(|s| s.parse::<Address>().map(|a| a == pair).unwrap_or(false))
    };
    if !config.only_pairs.is_empty() && !matches(&config.only_pairs) {
        return false;
    }
    if matches(&config.exclude_pairs) {
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// PairBook
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PairBook {
    pairs: HashMap<Address, PairState>,
}

impl PairBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, pair: &Address) -> Option<&PairState> {
        self.pairs.get(pair)
    }

    /// Fold an accepted event into the book and return the updated pair
    /// state (cloned, for lock-free evaluation downstream).
    pub fn integrate(&mut self, event: &FeedEvent, group_interval: i64, now_ts: i64) -> PairState {
        let group_key = event.minute_key.div_euclid(group_interval.max(1)) * group_interval.max(1);

        let pair = self
            .pairs
            .entry(event.pair_address)
            .or_insert_with(|| PairState::from_event(event, now_ts));

        // Mutable metadata follows the feed; identity fields stay as first
        // seen.
        pair.last_price = event.last_price;
        pair.liquidity = event.liquidity;
        pair.buy_tax = event.buy_tax;
        pair.sell_tax = event.sell_tax;
        pair.last_update_ts = now_ts;
        if !event.symbol.is_empty() {
            pair.symbol = event.symbol.clone();
        }
        if !event.name.is_empty() {
            pair.name = event.name.clone();
        }
        if !event.fork.is_empty() {
            pair.fork = event.fork.clone();
        }
        if event.fee > 0.0 {
            pair.fee = event.fee;
        }
        if event.tick_spacing.is_some() {
            pair.tick_spacing = event.tick_spacing;
        }

        let group = pair
            .groups
            .entry(group_key)
            .or_insert_with(|| Group::seed(event.last_price));
        group.apply(event);

        // Old minute keys may arrive late; the newest-group marker only
        // moves forward.
        pair.last_group_key = pair.last_group_key.max(group_key);

        pair.clone()
    }

    /// Retention pass: trim each pair to its newest `max_groups` windows and
    /// evict pairs idle for `idle_evict_secs` with no open trade. Returns
    /// the evicted pair addresses so callers can drop tied state.
    pub fn cleanup(
        &mut self,
        max_groups: usize,
        idle_evict_secs: u64,
        now_ts: i64,
        has_trade: impl Fn(Address) -> bool,
    ) -> (usize, Vec<Address>) {
        let mut trimmed = 0usize;
        for pair in self.pairs.values_mut() {
            while pair.groups.len() > max_groups {
                let oldest = *pair.groups.keys().next().expect("non-empty");
                pair.groups.remove(&oldest);
                trimmed += 1;
            }
        }

        let cutoff = now_ts - idle_evict_secs as i64;
        let evicted: Vec<Address> = self
            .pairs
            .iter()
            .filter(|(addr, p)| p.last_update_ts < cutoff && !has_trade(**addr))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &evicted {
            debug!(pair = %addr, "evicting idle pair");
            self.pairs.remove(addr);
        }

        if trimmed > 0 || !evicted.is_empty() {
            info!(
                trimmed_groups = trimmed,
                evicted_pairs = evicted.len(),
                "retention pass"
            );
        }
        (trimmed, evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const PAIR: &str = "0x00000000000000000000000000000000000000aa";

    fn market_json(price: f64, minute_key: i64) -> Value {
        serde_json::json!({
            "data": {
                "pairAddress": PAIR,
                "chain": "base_v3",
                "lastPrice": price,
                "buyVolume": 1.0,
                "sellVolume": 0.5,
                "liquidity": 10.0,
                "minuteKey": minute_key,
                "token0": "0x4200000000000000000000000000000000000006",
                "token1": "0x00000000000000000000000000000000000000bb",
                "token0Decimals": 18,
                "token1Decimals": 18,
                "fork": "uniswap",
                "fee": 0.3,
                "symbol": "TKN"
            }
        })
    }

    // -- normalization -------------------------------------------------------

    #[test]
    fn normalizes_nested_camel_case() {
        let event = normalize_event(&market_json(1.5, 100)).unwrap();
        assert_eq!(event.pair_address, PAIR.parse::<Address>().unwrap());
        assert_eq!(event.last_price, 1.5);
        assert_eq!(event.minute_key, 100);
        assert_eq!(event.protocol, Protocol::V3);
        assert_eq!(event.symbol, "TKN");
    }

    #[test]
    fn normalizes_flat_snake_case() {
        let raw = serde_json::json!({
            "pair_address": PAIR,
            "chain_tag": "base_v4",
            "last_price": "2.25",
            "buy_volume": 3.0,
            "sell_volume": 1.0,
            "liquidity": 42.0,
            "minute_key": 7,
            "tick_spacing": 60
        });
        let event = normalize_event(&raw).unwrap();
        assert_eq!(event.last_price, 2.25);
        assert_eq!(event.protocol, Protocol::V4);
        assert_eq!(event.tick_spacing, Some(60));
        // Absent decimals default to 18.
        assert_eq!(event.token0_decimals, 18);
    }

    #[test]
    fn drops_zero_price_and_missing_pair() {
        assert!(normalize_event(&market_json(0.0, 100)).is_none());
        assert!(normalize_event(&serde_json::json!({"lastPrice": 1.0})).is_none());
        let negative = market_json(-3.0, 100);
        assert!(normalize_event(&negative).is_none());
    }

    #[test]
    fn protocol_falls_back_to_chain_tag() {
        let mut raw = market_json(1.0, 100);
        raw["data"]["chain"] = "base_v2".into();
        assert_eq!(normalize_event(&raw).unwrap().protocol, Protocol::V2);
    }

    // -- filters -------------------------------------------------------------

    #[test]
    fn filters_respect_only_and_exclude() {
        let pair: Address = PAIR.parse().unwrap();
        let other = address!("00000000000000000000000000000000000000bb");

        let mut config = Config::default();
        assert!(passes_filters(&config, pair));

        config.only_pairs = vec![PAIR.into()];
        assert!(passes_filters(&config, pair));
        assert!(!passes_filters(&config, other));

        config.only_pairs.clear();
        config.exclude_pairs = vec![PAIR.into()];
        assert!(!passes_filters(&config, pair));
        assert!(passes_filters(&config, other));
    }

    // -- integration ---------------------------------------------------------

    #[test]
    fn integrate_creates_pair_and_groups() {
        let mut book = PairBook::new();
        let e1 = normalize_event(&market_json(1.0, 100)).unwrap();
        let e2 = normalize_event(&market_json(1.3, 100)).unwrap();
        let e3 = normalize_event(&market_json(1.62, 101)).unwrap();

        book.integrate(&e1, 1, 0);
        let snap = book.integrate(&e2, 1, 0);
        assert_eq!(snap.groups.len(), 1);
        let g = &snap.groups[&100];
        assert_eq!(g.first_price, 1.0);
        assert_eq!(g.last_price, 1.3);
        assert!((g.price_change_pct - 30.0).abs() < 1e-9);

        let snap = book.integrate(&e3, 1, 0);
        assert_eq!(snap.groups.len(), 2);
        assert_eq!(snap.last_group_key, 101);
        assert_eq!(snap.groups[&101].first_price, 1.62);
    }

    #[test]
    fn group_interval_buckets_minutes() {
        let mut book = PairBook::new();
        let mut e = normalize_event(&market_json(1.0, 100)).unwrap();
        let snap = book.integrate(&e, 5, 0);
        assert!(snap.groups.contains_key(&100));

        e.minute_key = 104;
        let snap = book.integrate(&e, 5, 0);
        // 104 falls in the same 5-minute bucket.
        assert_eq!(snap.groups.len(), 1);

        e.minute_key = 105;
        let snap = book.integrate(&e, 5, 0);
        assert!(snap.groups.contains_key(&105));
    }

    #[test]
    fn out_of_order_minute_keys_keep_marker_forward() {
        let mut book = PairBook::new();
        let mut e = normalize_event(&market_json(1.0, 110)).unwrap();
        book.integrate(&e, 1, 0);

        e.minute_key = 105;
        let snap = book.integrate(&e, 1, 0);
        // The late group exists, but the marker did not move backwards.
        assert!(snap.groups.contains_key(&105));
        assert_eq!(snap.last_group_key, 110);
    }

    // -- retention -----------------------------------------------------------

    #[test]
    fn cleanup_trims_to_max_groups() {
        let mut book = PairBook::new();
        let mut e = normalize_event(&market_json(1.0, 0)).unwrap();
        for minute in 0..10 {
            e.minute_key = minute;
            book.integrate(&e, 1, 0);
        }
        book.cleanup(3, 1800, 0, |_| false);
        let pair = book.get(&e.pair_address).unwrap();
        assert_eq!(pair.groups.len(), 3);
        // Newest survive.
        assert!(pair.groups.contains_key(&9));
        assert!(!pair.groups.contains_key(&0));
    }

    #[test]
    fn cleanup_evicts_idle_pairs_without_trades() {
        let mut book = PairBook::new();
        let e = normalize_event(&market_json(1.0, 0)).unwrap();
        book.integrate(&e, 1, 1000);

        // Still fresh at t=1000+1799.
        book.cleanup(60, 1800, 2799, |_| false);
        assert_eq!(book.len(), 1);

        // Idle past the cutoff, but an open trade pins it.
        book.cleanup(60, 1800, 3000, |_| true);
        assert_eq!(book.len(), 1);

        // Idle and unpinned.
        book.cleanup(60, 1800, 3000, |_| false);
        assert_eq!(book.len(), 0);
    }
}
