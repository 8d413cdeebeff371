use serde::{Deserialize, Serialize};

use crate::constants;

// ---------------------------------------------------------------------------
// Runtime config file (CONFIG_PATH)
// ---------------------------------------------------------------------------

/// Agent configuration, loaded from a single JSON file and live-updatable
/// through the control API (whitelisted keys only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Budget per full-size entry, in ETH.
    pub max_eth_per_trade: f64,
    /// Carried for operator visibility; swaps submit with protocol-level
    /// protection only (`min_amount_out = 0`).
    pub slippage: f64,
    pub max_positions: usize,
    /// Group window width in minutes.
    pub group_interval: i64,
    /// Per-pair cap on retained groups.
    pub max_groups: usize,
    /// When non-empty, only these pair addresses are ingested.
    pub only_pairs: Vec<String>,
    pub exclude_pairs: Vec<String>,
    pub policies: Vec<Policy>,
    /// Feed chain tags subscribed on connect.
    pub chains: Vec<String>,
    /// V2 swapper proxy address override.
    pub v2_swapper: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_eth_per_trade: 0.01,
            slippage: 1.0,
            max_positions: 5,
            group_interval: 1,
            max_groups: 60,
            only_pairs: Vec::new(),
            exclude_pairs: Vec::new(),
            policies: Vec::new(),
            chains: constants::DEFAULT_CHAIN_TAGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            v2_swapper: None,
        }
    }
}

/// A named pair of predicates. Either side may be absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_predicate: Option<String>,
}

// ---------------------------------------------------------------------------
// Process environment
// ---------------------------------------------------------------------------

/// Settings sourced from the process environment at startup.
#[derive(Debug, Clone)]
pub struct Environment {
    pub private_key: String,
    pub rpc_url: String,
    pub server_url: String,
    pub config_path: String,
    pub trades_path: String,
    pub trade_log_path: String,
    pub control_port: u16,
    pub log_dir: String,
}
