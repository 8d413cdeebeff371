//! Policy sandbox: compiles user predicates into a restricted scripting
//! engine and evaluates them against the rolling market state.
//!
//! Predicates are compiled lazily on first use and cached by
//! `(kind, policy_id)`; a compilation failure disables that predicate for
//! the life of the process (logged once). Runtime errors are caught and
//! mean "no action". The engine carries operation and depth limits so a
//! runaway script cannot stall the ingest task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use tracing::{debug, error, warn};

use crate::config::Policy;
use crate::core::state::GasSnapshot;
use crate::errors::AgentError;
use crate::types::{ActiveTrade, FeedEvent, Group, PairState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateKind {
    Entry,
    Exit,
}

impl PredicateKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

/// Everything a predicate can see, borrowed from the ingest task.
pub struct EvalContext<'a> {
    pub event: &'a FeedEvent,
    pub pair: &'a PairState,
    pub group_key: i64,
    pub trade: Option<&'a ActiveTrade>,
    pub rates: HashMap<String, f64>,
    pub gas: GasSnapshot,
}

/// Persistent scratch space exposed to predicates by reference.
///
/// `custom` entries are per pair and dropped with the pair; `global` lives
/// for the whole process.
#[derive(Default)]
pub struct ScratchSpace {
    global: Mutex<ScratchInner>,
}

#[derive(Default)]
struct ScratchInner {
    global: Map,
    per_pair: HashMap<Address, Map>,
}

impl ScratchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the scratch map tied to an evicted pair.
    pub fn evict_pair(&self, pair: Address) {
        self.global
            .lock()
            .expect("scratch lock poisoned")
            .per_pair
            .remove(&pair);
    }

    fn take(&self, pair: Address) -> (Map, Map) {
        let inner = self.global.lock().expect("scratch lock poisoned");
        (
            inner.per_pair.get(&pair).cloned().unwrap_or_default(),
            inner.global.clone(),
        )
    }

    fn store(&self, pair: Address, custom: Map, global: Map) {
        let mut inner = self.global.lock().expect("scratch lock poisoned");
        inner.per_pair.insert(pair, custom);
        inner.global = global;
    }
}

pub struct PolicyEngine {
    engine: Engine,
    compiled: HashMap<(PredicateKind, String), Option<AST>>,
    scratch: Arc<ScratchSpace>,
}

impl PolicyEngine {
    pub fn new(scratch: Arc<ScratchSpace>) -> Self {
        let mut engine = Engine::new();
        // Predicates are expected to be pure and fast.
        engine.set_max_operations(100_000);
        engine.set_max_expr_depths(64, 64);
        Self {
            engine,
            compiled: HashMap::new(),
            scratch,
        }
    }

    /// Run entry predicates in config order; the first non-zero action wins.
    pub fn evaluate_entry(&mut self, policies: &[Policy], ctx: &EvalContext) -> Option<(String, f64)> {
        for policy in policies {
            let Some(source) = &policy.entry_predicate else {
                continue;
            };
            let percent = self.eval_predicate(PredicateKind::Entry, &policy.id, source, ctx);
            if percent > 0.0 {
                return Some((policy.id.clone(), percent));
            }
        }
        None
    }

    /// Run the exit predicate of the policy that opened the trade.
    pub fn evaluate_exit(&mut self, policies: &[Policy], ctx: &EvalContext) -> Option<(String, f64)> {
        let trade = ctx.trade?;
        let policy = policies.iter().find(|p| p.id == trade.policy_id)?;
        let source = policy.exit_predicate.as_ref()?;
        let percent = self.eval_predicate(PredicateKind::Exit, &policy.id, source, ctx);
        if percent > 0.0 {
            Some((policy.id.clone(), percent))
        } else {
            None
        }
    }

    fn eval_predicate(
        &mut self,
        kind: PredicateKind,
        policy_id: &str,
        source: &str,
        ctx: &EvalContext,
    ) -> f64 {
        let key = (kind, policy_id.to_string());
        if !self.compiled.contains_key(&key) {
            let compiled = match self.engine.compile(source) {
                Ok(ast) => Some(ast),
                Err(e) => {
                    let err = AgentError::PolicyCompile {
                        policy_id: policy_id.to_string(),
                        reason: e.to_string(),
                    };
                    error!(kind = kind.as_str(), error = %err, "predicate disabled");
                    None
                }
            };
            self.compiled.insert(key.clone(), compiled);
        }
        let Some(Some(ast)) = self.compiled.get(&key) else {
            return 0.0;
        };

        let (custom, global) = self.scratch.take(ctx.pair.pair_address);
        let mut scope = build_scope(ctx, custom, global);

        let result = match self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast) {
            Ok(v) => v,
            Err(e) => {
                let err = AgentError::PolicyRuntime {
                    policy_id: policy_id.to_string(),
                    reason: e.to_string(),
                };
                warn!(
                    kind = kind.as_str(),
                    pair = %ctx.pair.pair_address,
                    error = %err,
                    "no action"
                );
                return 0.0;
            }
        };

        // Mutations to the scratch maps persist across evaluations.
        let custom = scope.get_value::<Map>("custom_data").unwrap_or_default();
        let global = scope.get_value::<Map>("global_data").unwrap_or_default();
        self.scratch.store(ctx.pair.pair_address, custom, global);

        let percent = action_percent(&result);
        if percent > 0.0 {
            debug!(
                policy_id,
                kind = kind.as_str(),
                pair = %ctx.pair.pair_address,
                percent,
                "predicate fired"
            );
        }
        percent
    }
}

// ---------------------------------------------------------------------------
// Result interpretation
// ---------------------------------------------------------------------------

/// Interpret a predicate return value as an action percentage.
///
/// `false`/`0` → 0, `true` → 100, numbers clamped into `[0, 100]`,
/// non-finite and non-numeric values → 0.
pub fn action_percent(result: &Dynamic) -> f64 {
    if let Ok(b) = result.clone().as_bool() {
        return if b { 100.0 } else { 0.0 };
    }
    if let Ok(i) = result.clone().as_int() {
        return (i as f64).clamp(0.0, 100.0);
    }
    if let Ok(f) = result.clone().as_float() {
        if !f.is_finite() {
            return 0.0;
        }
        return f.clamp(0.0, 100.0);
    }
    0.0
}

// ---------------------------------------------------------------------------
// Context construction
// ---------------------------------------------------------------------------

fn build_scope<'a>(ctx: &EvalContext, custom: Map, global: Map) -> Scope<'a> {
    let mut scope = Scope::new();

    scope.push("event", event_to_map(ctx.event));
    let group = ctx
        .pair
        .groups
        .get(&ctx.group_key)
        .map(|g| group_to_map(ctx.group_key, g))
        .unwrap_or_default();
    scope.push("group", group);

    let groups: rhai::Array = ctx
        .pair
        .groups_ordered()
        .into_iter()
        .map(|(key, g)| Dynamic::from(group_to_map(key, g)))
        .collect();
    scope.push("groups", groups);

    scope.push("pair", pair_to_map(ctx.pair));
    match ctx.trade {
        Some(trade) => scope.push("trade", trade_to_map(trade)),
        None => scope.push_dynamic("trade", Dynamic::UNIT),
    };

    let mut rates = Map::new();
    for (asset, rate) in &ctx.rates {
        rates.insert(asset.as_str().into(), Dynamic::from_float(*rate));
    }
    scope.push("prices", rates);

    let mut gas = Map::new();
    gas.insert("max_fee_gwei".into(), Dynamic::from_float(ctx.gas.max_fee_gwei));
    gas.insert(
        "priority_fee_gwei".into(),
        Dynamic::from_float(ctx.gas.priority_fee_gwei),
    );
    scope.push("gas", gas);

    scope.push("custom_data", custom);
    scope.push("global_data", global);
    scope
}

fn event_to_map(event: &FeedEvent) -> Map {
    let mut m = Map::new();
    m.insert("pair_address".into(), format!("{:#x}", event.pair_address).into());
    m.insert("chain".into(), event.chain_tag.clone().into());
    m.insert("last_price".into(), Dynamic::from_float(event.last_price));
    m.insert("buy_volume".into(), Dynamic::from_float(event.buy_volume));
    m.insert("sell_volume".into(), Dynamic::from_float(event.sell_volume));
    m.insert("liquidity".into(), Dynamic::from_float(event.liquidity));
    m.insert("minute_key".into(), Dynamic::from_int(event.minute_key));
    m
}

fn group_to_map(key: i64, group: &Group) -> Map {
    let mut m = Map::new();
    m.insert("group_key".into(), Dynamic::from_int(key));
    m.insert("first_price".into(), Dynamic::from_float(group.first_price));
    m.insert("last_price".into(), Dynamic::from_float(group.last_price));
    m.insert("min_price".into(), Dynamic::from_float(group.min_price));
    m.insert("max_price".into(), Dynamic::from_float(group.max_price));
    m.insert("price_change".into(), Dynamic::from_float(group.price_change));
    m.insert(
        "price_change_pct".into(),
        Dynamic::from_float(group.price_change_pct),
    );
    m.insert("buy_volume".into(), Dynamic::from_float(group.buy_volume));
    m.insert("sell_volume".into(), Dynamic::from_float(group.sell_volume));
    m.insert("total_volume".into(), Dynamic::from_float(group.total_volume));
    m.insert("buy_count".into(), Dynamic::from_int(group.buy_count as i64));
    m.insert("sell_count".into(), Dynamic::from_int(group.sell_count as i64));
    m.insert("volatility".into(), Dynamic::from_float(group.volatility));
    m
}

fn pair_to_map(pair: &PairState) -> Map {
    let mut m = Map::new();
    m.insert("pair_address".into(), format!("{:#x}", pair.pair_address).into());
    m.insert("token0".into(), format!("{:#x}", pair.token0).into());
    m.insert("token1".into(), format!("{:#x}", pair.token1).into());
    m.insert("protocol".into(), pair.protocol.as_str().into());
    m.insert("fork".into(), pair.fork.clone().into());
    m.insert("fee".into(), Dynamic::from_float(pair.fee));
    m.insert("symbol".into(), pair.symbol.clone().into());
    m.insert("last_price".into(), Dynamic::from_float(pair.last_price));
    m.insert("liquidity".into(), Dynamic::from_float(pair.liquidity));
    m.insert("buy_tax".into(), Dynamic::from_float(pair.buy_tax));
    m.insert("sell_tax".into(), Dynamic::from_float(pair.sell_tax));
    m.insert("last_group_key".into(), Dynamic::from_int(pair.last_group_key));
    m.insert("first_seen_ts".into(), Dynamic::from_int(pair.first_seen_ts));
    m
}

fn trade_to_map(trade: &ActiveTrade) -> Map {
    let mut m = Map::new();
    m.insert("pair_address".into(), format!("{:#x}", trade.pair_address).into());
    m.insert("policy_id".into(), trade.policy_id.clone().into());
    m.insert("entry_price".into(), Dynamic::from_float(trade.entry_price));
    m.insert("eth_spent".into(), Dynamic::from_float(trade.eth_spent));
    m.insert("eth_sold".into(), Dynamic::from_float(trade.eth_sold));
    m.insert("tokens_bought".into(), Dynamic::from_float(trade.tokens_bought));
    m.insert(
        "tokens_in_possession".into(),
        Dynamic::from_float(trade.tokens_in_possession),
    );
    m.insert("current_price".into(), Dynamic::from_float(trade.current_price));
    m.insert(
        "price_change_pct".into(),
        Dynamic::from_float(trade.price_change_pct),
    );
    m.insert(
        "min_price_since_entry".into(),
        Dynamic::from_float(trade.min_price_since_entry),
    );
    m.insert(
        "max_price_since_entry".into(),
        Dynamic::from_float(trade.max_price_since_entry),
    );
    m.insert(
        "current_eth_value".into(),
        Dynamic::from_float(trade.current_eth_value),
    );
    m.insert("opened_at".into(), Dynamic::from_int(trade.opened_at));
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use alloy::primitives::{address, U256};

    fn sample_event() -> FeedEvent {
        FeedEvent {
            pair_address: address!("00000000000000000000000000000000000000aa"),
            chain_tag: "base_v3".into(),
            last_price: 1.3,
            buy_volume: 2.0,
            sell_volume: 1.0,
            liquidity: 10.0,
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

    fn sample_pair() -> PairState {
        let event = sample_event();
        let mut pair = PairState::from_event(&event, 0);
        let mut group = Group::seed(1.0);
        group.apply(&event);
        pair.groups.insert(100, group);
        pair.last_group_key = 100;
        pair
    }

    fn sample_trade() -> ActiveTrade {
        ActiveTrade {
            pair_address: address!("00000000000000000000000000000000000000aa"),
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
            base_token: address!("4200000000000000000000000000000000000006"),
            policy_id: "breakout".into(),
            entry_price: 1.0,
            eth_spent: 0.01,
            eth_sold: 0.0,
            tokens_bought: 1000.0,
            tokens_in_possession: 1000.0,
            tokens_in_possession_raw: U256::from(1000u64),
            current_price: 1.3,
            price_change_pct: 30.0,
            min_price_since_entry: 1.0,
            max_price_since_entry: 1.3,
            current_eth_value: 1300.0,
            opened_at: 0,
        }
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Arc::new(ScratchSpace::new()))
    }

    fn eval(engine: &mut PolicyEngine, source: &str) -> f64 {
        let event = sample_event();
        let pair = sample_pair();
        let ctx = EvalContext {
            event: &event,
            pair: &pair,
            group_key: 100,
            trade: None,
            rates: HashMap::new(),
            gas: GasSnapshot::default(),
        };
        // Key the cache by the source text so each distinct predicate in a
        // test compiles independently.
        engine.eval_predicate(PredicateKind::Entry, source, source, &ctx)
    }

    // -- return value interpretation ----------------------------------------

    #[test]
    fn return_value_mapping() {
        let cases: &[(&str, f64)] = &[
            ("false", 0.0),
            ("0", 0.0),
            ("50", 50.0),
            ("100", 100.0),
            ("true", 100.0),
            ("150", 100.0),
            ("-10", 0.0),
            ("0.0 / 0.0", 0.0), // NaN
        ];
        for (source, expected) in cases {
            let mut engine = engine();
            assert_eq!(eval(&mut engine, source), *expected, "source: {source}");
        }
    }

    #[test]
    fn unit_result_is_no_action() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "let x = 1;"), 0.0);
    }

    // -- context -------------------------------------------------------------

    #[test]
    fn context_exposes_group_fields() {
        let mut engine = engine();
        // Group seeded at 1.0, last update 1.3 → +30%.
        assert_eq!(eval(&mut engine, "if group.price_change_pct > 25 { 100 } else { 0 }"), 100.0);
        assert_eq!(eval(&mut engine, "if group.price_change_pct > 50 { 100 } else { 0 }"), 0.0);
    }

    #[test]
    fn context_exposes_groups_array_and_pair() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "if groups.len() == 1 { 100 } else { 0 }"), 100.0);
        assert_eq!(
            eval(&mut engine, r#"if pair.symbol == "TKN" { 42 } else { 0 }"#),
            42.0
        );
    }

    #[test]
    fn trade_is_unit_on_entry() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "if trade == () { 100 } else { 0 }"), 100.0);
    }

    // -- scratch space -------------------------------------------------------

    #[test]
    fn custom_data_persists_across_evaluations() {
        let mut engine = engine();
        let source = r#"
            if !("count" in custom_data) { custom_data.count = 0; }
            custom_data.count += 1;
            custom_data.count
        "#;
        assert_eq!(eval(&mut engine, source), 1.0);
        assert_eq!(eval(&mut engine, source), 2.0);
        assert_eq!(eval(&mut engine, source), 3.0);
    }

    #[test]
    fn custom_data_dropped_on_pair_eviction() {
        let scratch = Arc::new(ScratchSpace::new());
        let mut engine = PolicyEngine::new(scratch.clone());
        let event = sample_event();
        let pair = sample_pair();
        let source = r#"
            if !("count" in custom_data) { custom_data.count = 0; }
            custom_data.count += 1;
            custom_data.count
        "#;
        let ctx = EvalContext {
            event: &event,
            pair: &pair,
            group_key: 100,
            trade: None,
            rates: HashMap::new(),
            gas: GasSnapshot::default(),
        };
        assert_eq!(engine.eval_predicate(PredicateKind::Entry, "t", source, &ctx), 1.0);
        scratch.evict_pair(pair.pair_address);
        assert_eq!(engine.eval_predicate(PredicateKind::Entry, "t", source, &ctx), 1.0);
    }

    // -- failure modes -------------------------------------------------------

    #[test]
    fn compile_failure_disables_predicate() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "if ( { nope"), 0.0);
        // Still disabled on the next evaluation; no panic, no recompile storm.
        assert_eq!(eval(&mut engine, "if ( { nope"), 0.0);
    }

    #[test]
    fn runtime_error_is_no_action() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "undefined_variable + 1"), 0.0);
        assert_eq!(eval(&mut engine, r#"throw "boom""#), 0.0);
    }

    // -- policy ordering -----------------------------------------------------

    #[test]
    fn first_firing_entry_policy_wins() {
        let mut engine = engine();
        let policies = vec![
            Policy {
                id: "quiet".into(),
                entry_predicate: Some("0".into()),
                exit_predicate: None,
            },
            Policy {
                id: "fires".into(),
                entry_predicate: Some("75".into()),
                exit_predicate: None,
            },
            Policy {
                id: "also_fires".into(),
                entry_predicate: Some("100".into()),
                exit_predicate: None,
            },
        ];
        let event = sample_event();
        let pair = sample_pair();
        let ctx = EvalContext {
            event: &event,
            pair: &pair,
            group_key: 100,
            trade: None,
            rates: HashMap::new(),
            gas: GasSnapshot::default(),
        };
        let (id, percent) = engine.evaluate_entry(&policies, &ctx).unwrap();
        assert_eq!(id, "fires");
        assert_eq!(percent, 75.0);
    }

    #[test]
    fn exit_uses_opening_policy() {
        let mut engine = engine();
        let policies = vec![
            Policy {
                id: "other".into(),
                entry_predicate: None,
                exit_predicate: Some("100".into()),
            },
            Policy {
                id: "breakout".into(),
                entry_predicate: None,
                exit_predicate: Some("if trade.price_change_pct > 20 { 50 } else { 0 }".into()),
            },
        ];
        let event = sample_event();
        let pair = sample_pair();
        let trade = sample_trade();
        let ctx = EvalContext {
            event: &event,
            pair: &pair,
            group_key: 100,
            trade: Some(&trade),
            rates: HashMap::new(),
            gas: GasSnapshot::default(),
        };
        let (id, percent) = engine.evaluate_exit(&policies, &ctx).unwrap();
        assert_eq!(id, "breakout");
        assert_eq!(percent, 50.0);
    }
}
