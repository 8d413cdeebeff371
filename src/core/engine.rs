//! Ingest engine: drives aggregation and policy evaluation off the feed
//! channel.
//!
//! Ordering: events for a pair are folded into the book and evaluated in
//! arrival order, and an evaluation always sees the state including its
//! triggering event. Actions run on spawned tasks behind the per-pair
//! execution lock so a slow swap never stalls ingestion.

use std::sync::{Arc, RwLock as StdRwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::core::aggregator::{normalize_event, passes_filters, PairBook};
use crate::core::feed::FeedMessage;
use crate::core::policy::{EvalContext, PolicyEngine, ScratchSpace};
use crate::core::state::RuntimeState;
use crate::core::trade_manager::TradeManager;

pub struct IngestEngine {
    pairs: Arc<StdRwLock<PairBook>>,
    trades: Arc<TradeManager>,
    policy: PolicyEngine,
    state: Arc<RuntimeState>,
    config: Arc<StdRwLock<Config>>,
    rx: mpsc::Receiver<FeedMessage>,
    shutdown: CancellationToken,
}

impl IngestEngine {
    pub fn new(
        pairs: Arc<StdRwLock<PairBook>>,
        trades: Arc<TradeManager>,
        scratch: Arc<ScratchSpace>,
        state: Arc<RuntimeState>,
        config: Arc<StdRwLock<Config>>,
        rx: mpsc::Receiver<FeedMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pairs,
            trades,
            policy: PolicyEngine::new(scratch),
            state,
            config,
            rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.rx.recv() => {
                    match msg {
                        Some(FeedMessage::Market(raw)) => self.handle_market(&raw),
                        Some(FeedMessage::UsdRates(rates)) => self.state.update_rates(&rates),
                        None => break,
                    }
                }
            }
        }
        debug!("ingest engine stopped");
    }

    fn handle_market(&mut self, raw: &serde_json::Value) {
        let Some(event) = normalize_event(raw) else {
            return;
        };

        let config = self.config.read().expect("config lock").clone();
        if !passes_filters(&config, event.pair_address) {
            return;
        }

        let now_ts = chrono::Utc::now().timestamp();
        let pair = self
            .pairs
            .write()
            .expect("pair book lock")
            .integrate(&event, config.group_interval, now_ts);

        self.trades.observe_price(event.pair_address, event.last_price);

        // No evaluation while an action is in flight on this pair, and none
        // at all while paused.
        if self.state.is_paused() || self.trades.is_locked(event.pair_address) {
            return;
        }

        let interval = config.group_interval.max(1);
        let group_key = event.minute_key.div_euclid(interval) * interval;
        let trade = self.trades.get_trade(event.pair_address);

        let ctx = EvalContext {
            event: &event,
            pair: &pair,
            group_key,
            trade: trade.as_ref(),
            rates: self.state.rates(),
            gas: self.state.gas(),
        };

        if trade.is_some() {
            if let Some((policy_id, percent)) = self.policy.evaluate_exit(&config.policies, &ctx) {
                debug!(
                    pair = %event.pair_address,
                    policy_id,
                    percent,
                    "exit predicate fired"
                );
                let trades = self.trades.clone();
                let pair_state = pair.clone();
                tokio::spawn(async move {
                    if let Err(e) = trades
                        .policy_exit(pair_state.pair_address, percent, Some(pair_state.clone()))
                        .await
                    {
                        error!(pair = %pair_state.pair_address, error = %e, "policy exit failed");
                    }
                });
            }
        } else if self.trades.active_count() < config.max_positions {
            if let Some((policy_id, percent)) = self.policy.evaluate_entry(&config.policies, &ctx) {
                debug!(
                    pair = %event.pair_address,
                    policy_id,
                    percent,
                    "entry predicate fired"
                );
                let trades = self.trades.clone();
                let pair_state = pair.clone();
                let max_eth = config.max_eth_per_trade;
                let max_positions = config.max_positions;
                tokio::spawn(async move {
                    if let Err(e) = trades
                        .policy_entry(&pair_state, &policy_id, percent, max_eth, max_positions)
                        .await
                    {
                        error!(pair = %pair_state.pair_address, error = %e, "policy entry failed");
                    }
                });
            }
        }
    }
}
