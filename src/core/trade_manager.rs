//! Trade lifecycle: entry and exit dispatch, per-pair execution locks,
//! on-chain balance reconciliation, and crash-safe persistence.
//!
//! All lifecycle mutations are serialized through a per-pair async mutex:
//! policy actions, manual control, and reconciliation contend on the same
//! lock, so at most one entry or exit is in flight per pair. The in-memory
//! maps are the state of record; the snapshot on disk trails them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use alloy::primitives::{Address, U256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::constants::{CLANKER, WETH, ZORA};
use crate::errors::AgentError;
use crate::execution::approvals::ApprovalManager;
use crate::execution::chain::ChainClient;
use crate::execution::swap::{eth_to_wei, raw_to_readable, SwapAction, SwapRouter};
use crate::core::state::RuntimeState;
use crate::storage::TradeStore;
use crate::types::{
    ActiveTrade, CloseReason, InactiveTrade, PairState, Protocol, Summary, TradeLogEntry,
    TradeLogStatus, TradeLogType,
};

/// Outcome of an exit attempt, for control-plane responses.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExitResult {
    pub closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    pub eth_received: f64,
    pub tokens_sold: f64,
}

pub struct TradeManager {
    chain: Arc<ChainClient>,
    router: Arc<SwapRouter>,
    approvals: ApprovalManager,
    store: TradeStore,
    state: Arc<RuntimeState>,
    active: StdRwLock<HashMap<Address, ActiveTrade>>,
    inactive: StdRwLock<Vec<InactiveTrade>>,
    locks: StdMutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

impl TradeManager {
    pub fn new(
        chain: Arc<ChainClient>,
        router: Arc<SwapRouter>,
        store: TradeStore,
        state: Arc<RuntimeState>,
    ) -> Self {
        Self {
            approvals: ApprovalManager::new(chain.clone()),
            chain,
            router,
            store,
            state,
            active: StdRwLock::new(HashMap::new()),
            inactive: StdRwLock::new(Vec::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // State access
    // -----------------------------------------------------------------------

    pub fn has_trade(&self, pair: Address) -> bool {
        self.active.read().expect("active lock").contains_key(&pair)
    }

    pub fn get_trade(&self, pair: Address) -> Option<ActiveTrade> {
        self.active.read().expect("active lock").get(&pair).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().expect("active lock").len()
    }

    pub fn active_trades(&self) -> Vec<ActiveTrade> {
        self.active.read().expect("active lock").values().cloned().collect()
    }

    pub fn inactive_trades(&self) -> Vec<InactiveTrade> {
        self.inactive.read().expect("inactive lock").clone()
    }

    pub fn summary(&self) -> Summary {
        let active = self.active.read().expect("active lock");
        let inactive = self.inactive.read().expect("inactive lock");
        Summary::from_trades(
            &active.values().collect::<Vec<_>>(),
            &inactive.iter().collect::<Vec<_>>(),
            self.state.weth_usd(),
        )
    }

    /// Whether an entry or exit is currently in flight for `pair`.
    pub fn is_locked(&self, pair: Address) -> bool {
        let lock = self.pair_lock(pair);
        let result = lock.try_lock().is_err();
        result
    }

    fn pair_lock(&self, pair: Address) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("locks mutex");
        locks.entry(pair).or_default().clone()
    }

    /// Refresh mark-to-market fields from the latest feed price.
    pub fn observe_price(&self, pair: Address, price: f64) {
        let mut active = self.active.write().expect("active lock");
        if let Some(trade) = active.get_mut(&pair) {
            trade.mark_price(price);
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load the persisted snapshot into memory. Returns the open-trade count.
    pub fn load_persisted(&self) -> Result<usize, AgentError> {
        let snapshot = self.store.load_snapshot()?;
        let count = snapshot.active_trades.len();
        *self.active.write().expect("active lock") = snapshot.active_trades;
        *self.inactive.write().expect("inactive lock") = snapshot.inactive_trades;
        info!(
            open = count,
            closed = self.inactive.read().expect("inactive lock").len(),
            "persisted trades loaded"
        );
        Ok(count)
    }

    /// Rewrite the snapshot from current in-memory state. Failures are
    /// logged; the in-memory state keeps running.
    pub fn write_snapshot(&self) {
        let summary = self.summary();
        let active = self.active.read().expect("active lock").clone();
        let inactive = self.inactive.read().expect("inactive lock").clone();
        if let Err(e) = self.store.write_snapshot(&active, &inactive, &summary) {
            error!(error = %e, "snapshot write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    /// Policy-driven entry. Preconditions: not paused, below the position
    /// cap, no open trade on the pair, execution lock free.
    pub async fn policy_entry(
        &self,
        pair: &PairState,
        policy_id: &str,
        percent: f64,
        max_eth_per_trade: f64,
        max_positions: usize,
    ) -> Result<(), AgentError> {
        if self.state.is_paused() {
            return Ok(());
        }

        let lock = self.pair_lock(pair.pair_address);
        let Ok(_guard) = lock.try_lock() else {
            return Ok(());
        };

        // Checked under the lock; concurrent entries on other pairs may have
        // landed since evaluation.
        {
            let active = self.active.read().expect("active lock");
            if active.len() >= max_positions || active.contains_key(&pair.pair_address) {
                return Ok(());
            }
        }

        let eth_amount = max_eth_per_trade * percent.clamp(0.0, 100.0) / 100.0;
        self.entry_inner(pair, policy_id, percent, eth_amount).await
    }

    /// Manual entry from the control plane. Rejects a duplicate position
    /// or a pair with an action in flight.
    pub async fn manual_buy(&self, pair: &PairState, eth_amount: f64) -> Result<(), AgentError> {
        if self.has_trade(pair.pair_address) {
            return Err(AgentError::DuplicateTrade {
                pair: format!("{:#x}", pair.pair_address),
            });
        }
        let lock = self.pair_lock(pair.pair_address);
        let Ok(_guard) = lock.try_lock() else {
            return Err(AgentError::LockHeld {
                pair: format!("{:#x}", pair.pair_address),
            });
        };
        self.entry_inner(pair, "manual", 100.0, eth_amount).await
    }

    async fn entry_inner(
        &self,
        pair: &PairState,
        policy_id: &str,
        percent: f64,
        eth_amount: f64,
    ) -> Result<(), AgentError> {
        let amount_raw = eth_to_wei(eth_amount);
        if amount_raw == U256::ZERO {
            return Err(AgentError::ControlInput(format!(
                "entry amount must be positive, got {eth_amount}"
            )));
        }

        let base_token = pick_base_token(pair.token0, pair.token1);
        let is_token0_in = base_token == pair.token0;
        let spender = self.router.spender_for(pair);

        info!(
            pair = %pair.pair_address,
            symbol = %pair.symbol,
            policy_id,
            eth_amount,
            protocol = pair.protocol.as_str(),
            "opening position"
        );

        let result: Result<_, AgentError> = async {
            self.approvals
                .ensure_erc20_approval(base_token, spender, amount_raw)
                .await?;
            if pair.protocol == Protocol::V4 {
                self.approvals
                    .ensure_permit2_approval(base_token, amount_raw)
                    .await?;
            }
            self.router
                .perform_swap(pair, amount_raw, is_token0_in, U256::ZERO, SwapAction::Buy)
                .await
        }
        .await;

        match result {
            Ok(outcome) => {
                let now = chrono::Utc::now().timestamp();
                let trade = ActiveTrade {
                    pair_address: pair.pair_address,
                    token0: pair.token0,
                    token1: pair.token1,
                    token0_decimals: pair.token0_decimals,
                    token1_decimals: pair.token1_decimals,
                    protocol: pair.protocol,
                    fork: pair.fork.clone(),
                    fee: pair.fee,
                    tick_spacing: pair.tick_spacing,
                    hooks: pair.hooks,
                    symbol: pair.symbol.clone(),
                    base_token,
                    policy_id: policy_id.to_string(),
                    entry_price: pair.last_price,
                    eth_spent: eth_amount,
                    eth_sold: 0.0,
                    tokens_bought: outcome.readable_out,
                    tokens_in_possession: outcome.readable_out,
                    tokens_in_possession_raw: outcome.amount_out_raw,
                    current_price: pair.last_price,
                    price_change_pct: 0.0,
                    min_price_since_entry: pair.last_price,
                    max_price_since_entry: pair.last_price,
                    current_eth_value: outcome.readable_out * pair.last_price,
                    opened_at: now,
                };
                self.active
                    .write()
                    .expect("active lock")
                    .insert(pair.pair_address, trade);
                self.write_snapshot();
                self.log_trade(
                    TradeLogType::Buy,
                    TradeLogStatus::Success,
                    pair.pair_address,
                    &pair.symbol,
                    policy_id,
                    percent,
                    Some(eth_amount),
                    Some(outcome.readable_out),
                    None,
                );
                Ok(())
            }
            Err(e) => {
                warn!(pair = %pair.pair_address, error = %e, "buy failed");
                self.log_trade(
                    TradeLogType::Buy,
                    TradeLogStatus::Failed,
                    pair.pair_address,
                    &pair.symbol,
                    policy_id,
                    percent,
                    Some(eth_amount),
                    None,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Policy-driven exit; silently skips when the lock is contended.
    pub async fn policy_exit(
        &self,
        pair_address: Address,
        percent: f64,
        live_pair: Option<PairState>,
    ) -> Result<Option<ExitResult>, AgentError> {
        if self.state.is_paused() {
            return Ok(None);
        }
        let lock = self.pair_lock(pair_address);
        let Ok(_guard) = lock.try_lock() else {
            return Ok(None);
        };
        self.exit_inner(pair_address, percent, live_pair, CloseReason::PolicyExit)
            .await
            .map(Some)
    }

    /// Manual exit from the control plane. Rejects a missing trade or a
    /// contended lock.
    pub async fn manual_sell(
        &self,
        pair_address: Address,
        percent: f64,
        live_pair: Option<PairState>,
    ) -> Result<ExitResult, AgentError> {
        if !self.has_trade(pair_address) {
            return Err(AgentError::NoSuchTrade {
                pair: format!("{pair_address:#x}"),
            });
        }
        let lock = self.pair_lock(pair_address);
        let Ok(_guard) = lock.try_lock() else {
            return Err(AgentError::LockHeld {
                pair: format!("{pair_address:#x}"),
            });
        };
        self.exit_inner(pair_address, percent, live_pair, CloseReason::Manual)
            .await
    }

    async fn exit_inner(
        &self,
        pair_address: Address,
        percent: f64,
        live_pair: Option<PairState>,
        reason: CloseReason,
    ) -> Result<ExitResult, AgentError> {
        let Some(trade) = self.get_trade(pair_address) else {
            return Err(AgentError::NoSuchTrade {
                pair: format!("{pair_address:#x}"),
            });
        };

        // The chain is the source of truth for what we can sell.
        let held = trade.held_token();
        let balance = self.chain.balance_of(held, self.chain.owner()).await?;
        if balance == U256::ZERO {
            info!(pair = %pair_address, "zero balance on exit — archiving");
            self.archive(pair_address, CloseReason::ZeroBalance);
            self.write_snapshot();
            return Ok(ExitResult {
                closed: true,
                close_reason: Some(CloseReason::ZeroBalance),
                eth_received: 0.0,
                tokens_sold: 0.0,
            });
        }

        let percent = percent.min(100.0);
        let sell_raw = portion_of(balance, percent);
        if sell_raw == U256::ZERO {
            return Ok(ExitResult {
                closed: false,
                close_reason: None,
                eth_received: 0.0,
                tokens_sold: 0.0,
            });
        }

        let pair = live_pair.unwrap_or_else(|| pair_from_trade(&trade));
        let spender = self.router.spender_for(&pair);
        let policy_id = if reason == CloseReason::Manual {
            "manual".to_string()
        } else {
            trade.policy_id.clone()
        };

        info!(
            pair = %pair_address,
            symbol = %trade.symbol,
            percent,
            sell_raw = %sell_raw,
            "selling position"
        );

        let result: Result<_, AgentError> = async {
            self.approvals
                .ensure_erc20_approval(held, spender, sell_raw)
                .await?;
            if trade.protocol == Protocol::V4 {
                self.approvals.ensure_permit2_approval(held, sell_raw).await?;
            }
            self.router
                .perform_swap(
                    &pair,
                    sell_raw,
                    trade.is_token0_in(),
                    U256::ZERO,
                    SwapAction::Sell,
                )
                .await
        }
        .await;

        match result {
            Ok(outcome) => {
                let tokens_sold = raw_to_readable(sell_raw, trade.held_token_decimals());
                let closed = percent >= 100.0;
                {
                    let mut active = self.active.write().expect("active lock");
                    if let Some(t) = active.get_mut(&pair_address) {
                        t.eth_sold += outcome.readable_out;
                        if !closed {
                            let remaining_raw = balance - sell_raw;
                            t.tokens_in_possession_raw = remaining_raw;
                            t.tokens_in_possession =
                                raw_to_readable(remaining_raw, t.held_token_decimals());
                            t.current_eth_value = t.tokens_in_possession * t.current_price;
                        }
                    }
                }
                if closed {
                    self.archive(pair_address, reason);
                }
                self.write_snapshot();
                self.log_trade(
                    TradeLogType::Sell,
                    TradeLogStatus::Success,
                    pair_address,
                    &trade.symbol,
                    &policy_id,
                    percent,
                    Some(outcome.readable_out),
                    Some(tokens_sold),
                    None,
                );
                Ok(ExitResult {
                    closed,
                    close_reason: closed.then_some(reason),
                    eth_received: outcome.readable_out,
                    tokens_sold,
                })
            }
            Err(e) => {
                // The trade stays open; reconciliation or the next
                // evaluation picks it up.
                warn!(pair = %pair_address, error = %e, "sell failed");
                self.log_trade(
                    TradeLogType::Sell,
                    TradeLogStatus::Failed,
                    pair_address,
                    &trade.symbol,
                    &policy_id,
                    percent,
                    None,
                    None,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Move an active trade to the inactive list.
    fn archive(&self, pair_address: Address, reason: CloseReason) {
        let removed = self.active.write().expect("active lock").remove(&pair_address);
        if let Some(trade) = removed {
            let now = chrono::Utc::now().timestamp();
            let exit_price = trade.current_price;
            let closed = InactiveTrade::close(trade, exit_price, now, reason);
            info!(
                pair = %pair_address,
                reason = ?reason,
                pnl_eth = closed.realized_pnl_eth,
                "position closed"
            );
            self.inactive.write().expect("inactive lock").push(closed);
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Re-read on-chain balances for every open trade and correct the
    /// in-memory state. Read errors skip the pair without mutating it.
    pub async fn reconcile(&self) -> Result<usize, AgentError> {
        let pairs: Vec<(Address, Address, u8)> = self
            .active
            .read()
            .expect("active lock")
            .values()
            .map(|t| (t.pair_address, t.held_token(), t.held_token_decimals()))
            .collect();

        let mut changed = 0usize;
        for (pair_address, held, decimals) in pairs {
            // Skip pairs with an action in flight; they refresh themselves.
            let lock = self.pair_lock(pair_address);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };

            let balance = match self.chain.balance_of(held, self.chain.owner()).await {
                Ok(b) => b,
                Err(e) => {
                    let err = AgentError::Reconciliation {
                        reason: format!("balance read for {held}: {e}"),
                    };
                    warn!(pair = %pair_address, error = %err, "pair skipped");
                    continue;
                }
            };

            if balance == U256::ZERO {
                info!(pair = %pair_address, "reconcile found zero balance — archiving");
                self.archive(pair_address, CloseReason::ZeroBalance);
                changed += 1;
                continue;
            }

            let mut active = self.active.write().expect("active lock");
            if let Some(trade) = active.get_mut(&pair_address) {
                if trade.tokens_in_possession_raw != balance {
                    trade.tokens_in_possession_raw = balance;
                    trade.tokens_in_possession = raw_to_readable(balance, decimals);
                    trade.current_eth_value = trade.tokens_in_possession * trade.current_price;
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.write_snapshot();
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn log_trade(
        &self,
        log_type: TradeLogType,
        status: TradeLogStatus,
        pair: Address,
        symbol: &str,
        policy_id: &str,
        action_percent: f64,
        eth_amount: Option<f64>,
        tokens_amount: Option<f64>,
        error: Option<String>,
    ) {
        self.store.append_log(&TradeLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            log_type,
            status,
            symbol: symbol.to_string(),
            pair,
            policy_id: policy_id.to_string(),
            action_percent,
            eth_amount,
            tokens_amount,
            error,
        });
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// The cash side of a pair: a whitelisted alt base when present, else WETH.
pub fn pick_base_token(token0: Address, token1: Address) -> Address {
    for candidate in [ZORA, CLANKER] {
        if token0 == candidate || token1 == candidate {
            return candidate;
        }
    }
    WETH
}

/// `balance × percent / 100` in integer math at basis-point resolution.
pub fn portion_of(balance: U256, percent: f64) -> U256 {
    let bps = (percent.clamp(0.0, 100.0) * 100.0).round() as u64;
    balance * U256::from(bps) / U256::from(10_000u64)
}

/// Rebuild swap-relevant pair metadata from a trade snapshot, for exits on
/// pairs the feed no longer tracks.
fn pair_from_trade(trade: &ActiveTrade) -> PairState {
    PairState {
        pair_address: trade.pair_address,
        token0: trade.token0,
        token1: trade.token1,
        token0_decimals: trade.token0_decimals,
        token1_decimals: trade.token1_decimals,
        protocol: trade.protocol,
        fork: trade.fork.clone(),
        fee: trade.fee,
        tick_spacing: trade.tick_spacing,
        hooks: trade.hooks,
        chain_tag: String::new(),
        last_price: trade.current_price,
        liquidity: 0.0,
        symbol: trade.symbol.clone(),
        name: String::new(),
        buy_tax: 0.0,
        sell_tax: 0.0,
        last_group_key: 0,
        first_seen_ts: trade.opened_at,
        last_update_ts: trade.opened_at,
        groups: Default::default(),
    }
}
