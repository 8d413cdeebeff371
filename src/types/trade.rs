//! Trade lifecycle records: open positions, closed positions, the derived
//! summary, and the append-only trade-log line format.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::types::Protocol;

/// Why a position left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PolicyExit,
    Manual,
    ZeroBalance,
}

/// An open position on one pair. At most one per pair address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTrade {
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
    pub symbol: String,
    /// The cash side of the position (WETH or a whitelisted alternative).
    pub base_token: Address,
    pub policy_id: String,
    pub entry_price: f64,
    pub eth_spent: f64,
    /// Cumulative output across partial exits.
    pub eth_sold: f64,
    pub tokens_bought: f64,
    pub tokens_in_possession: f64,
    /// Exact on-chain balance, refreshed by reconciliation.
    pub tokens_in_possession_raw: U256,
    pub current_price: f64,
    pub price_change_pct: f64,
    pub min_price_since_entry: f64,
    pub max_price_since_entry: f64,
    pub current_eth_value: f64,
    pub opened_at: i64,
}

impl ActiveTrade {
    /// The token held by the position (the non-base side of the pair).
    pub fn held_token(&self) -> Address {
        if self.base_token == self.token0 {
            self.token1
        } else {
            self.token0
        }
    }

    /// Decimals of the held token.
    pub fn held_token_decimals(&self) -> u8 {
        if self.base_token == self.token0 {
            self.token1_decimals
        } else {
            self.token0_decimals
        }
    }

    /// Whether the buy direction spends token0.
    pub fn is_token0_in(&self) -> bool {
        self.base_token == self.token0
    }

    /// Refresh mark-to-market fields from a new pair price.
    pub fn mark_price(&mut self, price: f64) {
        self.current_price = price;
        self.min_price_since_entry = self.min_price_since_entry.min(price);
        self.max_price_since_entry = self.max_price_since_entry.max(price);
        self.price_change_pct = if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        };
        self.current_eth_value = self.tokens_in_possession * price;
    }
}

/// A closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InactiveTrade {
    #[serde(flatten)]
    pub trade: ActiveTrade,
    pub exit_price: f64,
    pub closed_at: i64,
    pub realized_pnl_eth: f64,
    pub realized_pnl_pct: f64,
    pub close_reason: CloseReason,
}

impl InactiveTrade {
    pub fn close(trade: ActiveTrade, exit_price: f64, closed_at: i64, reason: CloseReason) -> Self {
        let realized_pnl_eth = trade.eth_sold - trade.eth_spent;
        let realized_pnl_pct = if trade.eth_spent > 0.0 {
            realized_pnl_eth / trade.eth_spent * 100.0
        } else {
            0.0
        };
        Self {
            trade,
            exit_price,
            closed_at,
            realized_pnl_eth,
            realized_pnl_pct,
            close_reason: reason,
        }
    }
}

/// Aggregate view over active and inactive trades. Derived on demand; the
/// persisted copy in the snapshot is informational only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub open_trades: usize,
    pub closed_trades: usize,
    pub unrealized_pnl_eth: f64,
    pub realized_pnl_eth: f64,
    pub wins: usize,
    pub losses: usize,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub win_rate_pct: f64,
    pub volume_eth: f64,
    pub net_roi_pct: f64,
    pub unrealized_pnl_usd: f64,
    pub realized_pnl_usd: f64,
}

impl Summary {
    /// Compute from the current trade sets. `weth_usd` converts the ETH
    /// figures; zero when no rate has been seen yet.
    pub fn from_trades(active: &[&ActiveTrade], closed: &[&InactiveTrade], weth_usd: f64) -> Self {
        let open_trades = active.len();
        let closed_trades = closed.len();

        let unrealized_pnl_eth: f64 = active
            .iter()
            .map(|t| t.current_eth_value + t.eth_sold - t.eth_spent)
            .sum();
        let realized_pnl_eth: f64 = closed.iter().map(|t| t.realized_pnl_eth).sum();

        let wins: Vec<_> = closed
            .iter()
            .filter(|t| t.trade.eth_sold >= t.trade.eth_spent)
            .collect();
        let losses_n = closed_trades - wins.len();

        let avg = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };
        let win_pcts: Vec<f64> = wins.iter().map(|t| t.realized_pnl_pct).collect();
        let loss_pcts: Vec<f64> = closed
            .iter()
            .filter(|t| t.trade.eth_sold < t.trade.eth_spent)
            .map(|t| t.realized_pnl_pct)
            .collect();

        let volume_eth: f64 = active
            .iter()
            .map(|t| t.eth_spent + t.eth_sold)
            .chain(closed.iter().map(|t| t.trade.eth_spent + t.trade.eth_sold))
            .sum();

        let closed_spent: f64 = closed.iter().map(|t| t.trade.eth_spent).sum();
        let net_roi_pct = if closed_spent > 0.0 {
            realized_pnl_eth / closed_spent * 100.0
        } else {
            0.0
        };

        Self {
            open_trades,
            closed_trades,
            unrealized_pnl_eth,
            realized_pnl_eth,
            wins: wins.len(),
            losses: losses_n,
            avg_win_pct: avg(&win_pcts),
            avg_loss_pct: avg(&loss_pcts),
            win_rate_pct: if closed_trades > 0 {
                wins.len() as f64 / closed_trades as f64 * 100.0
            } else {
                0.0
            },
            volume_eth,
            net_roi_pct,
            unrealized_pnl_usd: unrealized_pnl_eth * weth_usd,
            realized_pnl_usd: realized_pnl_eth * weth_usd,
        }
    }
}

// ---------------------------------------------------------------------------
// Trade log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeLogType {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeLogStatus {
    Success,
    Failed,
    Error,
}

/// One line in the append-only JSONL trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub log_type: TradeLogType,
    pub status: TradeLogStatus,
    pub symbol: String,
    pub pair: Address,
    pub policy_id: String,
    pub action_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use alloy::primitives::address;

    fn trade(eth_spent: f64, eth_sold: f64) -> ActiveTrade {
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
            policy_id: "p1".into(),
            entry_price: 1.0,
            eth_spent,
            eth_sold,
            tokens_bought: 1000.0,
            tokens_in_possession: 1000.0,
            tokens_in_possession_raw: U256::from(1000u64) * U256::from(10u64).pow(U256::from(18)),
            current_price: 1.0,
            price_change_pct: 0.0,
            min_price_since_entry: 1.0,
            max_price_since_entry: 1.0,
            current_eth_value: 1000.0,
            opened_at: 0,
        }
    }

    #[test]
    fn held_token_is_non_base_side() {
        let t = trade(0.01, 0.0);
        assert_eq!(t.held_token(), t.token1);
        assert!(t.is_token0_in());
    }

    #[test]
    fn realized_pnl_is_sold_minus_spent() {
        let closed = InactiveTrade::close(trade(0.01, 0.015), 1.5, 10, CloseReason::PolicyExit);
        assert!((closed.realized_pnl_eth - 0.005).abs() < 1e-12);
        assert!((closed.realized_pnl_pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn mark_price_tracks_extremes() {
        let mut t = trade(0.01, 0.0);
        t.mark_price(2.0);
        t.mark_price(0.5);
        assert_eq!(t.max_price_since_entry, 2.0);
        assert_eq!(t.min_price_since_entry, 0.5);
        assert!((t.price_change_pct + 50.0).abs() < 1e-9);
    }

    #[test]
    fn summary_counts_wins_and_losses() {
        let a1 = trade(0.01, 0.0);
        let c1 = InactiveTrade::close(trade(0.01, 0.02), 2.0, 10, CloseReason::PolicyExit);
        let c2 = InactiveTrade::close(trade(0.01, 0.005), 0.5, 11, CloseReason::Manual);
        let s = Summary::from_trades(&[&a1], &[&c1, &c2], 2000.0);
        assert_eq!(s.open_trades, 1);
        assert_eq!(s.closed_trades, 2);
        assert_eq!(s.wins, 1);
        assert_eq!(s.losses, 1);
        assert!((s.win_rate_pct - 50.0).abs() < 1e-9);
        assert!((s.realized_pnl_eth - 0.005).abs() < 1e-12);
        assert!((s.realized_pnl_usd - 10.0).abs() < 1e-9);
    }

    #[test]
    fn trade_log_line_round_trips() {
        let entry = TradeLogEntry {
            timestamp: "2026-01-01T00:00:00Z".into(),
            log_type: TradeLogType::Buy,
            status: TradeLogStatus::Success,
            symbol: "TKN".into(),
            pair: address!("00000000000000000000000000000000000000aa"),
            policy_id: "p1".into(),
            action_percent: 100.0,
            eth_amount: Some(0.01),
            tokens_amount: Some(1000.0),
            error: None,
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"BUY\""));
        assert!(line.contains("\"SUCCESS\""));
        let back: TradeLogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.log_type, TradeLogType::Buy);
        assert_eq!(back.status, TradeLogStatus::Success);
    }
}
