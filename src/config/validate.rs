use std::collections::HashSet;

use crate::errors::AgentError;

use super::types::Config;

/// Reject configs that would misbehave at runtime. Runs at startup and
/// again on every live update before anything is persisted.
pub fn validate_config(config: &Config) -> Result<(), AgentError> {
    if config.max_eth_per_trade <= 0.0 || !config.max_eth_per_trade.is_finite() {
        return Err(AgentError::Config(format!(
            "max_eth_per_trade must be a positive number, got {}",
            config.max_eth_per_trade
        )));
    }

    if !(0.0..=100.0).contains(&config.slippage) {
        return Err(AgentError::Config(format!(
            "slippage must be within [0, 100], got {}",
            config.slippage
        )));
    }

    if config.max_positions == 0 {
        return Err(AgentError::Config("max_positions must be at least 1".into()));
    }

    if config.group_interval < 1 {
        return Err(AgentError::Config(format!(
            "group_interval must be at least 1 minute, got {}",
            config.group_interval
        )));
    }

    if config.max_groups == 0 {
        return Err(AgentError::Config("max_groups must be at least 1".into()));
    }

    let mut seen = HashSet::new();
    for policy in &config.policies {
        if policy.id.trim().is_empty() {
            return Err(AgentError::Config("policy id must not be empty".into()));
        }
        if !seen.insert(policy.id.as_str()) {
            return Err(AgentError::Config(format!(
                "duplicate policy id: {}",
                policy.id
            )));
        }
    }

    for addr in config.only_pairs.iter().chain(&config.exclude_pairs) {
        if addr.parse::<alloy::primitives::Address>().is_err() {
            return Err(AgentError::Config(format!(
                "invalid pair address in filter list: {addr}"
            )));
        }
    }

    if let Some(swapper) = &config.v2_swapper {
        if swapper.parse::<alloy::primitives::Address>().is_err() {
            return Err(AgentError::Config(format!(
                "invalid v2_swapper address: {swapper}"
            )));
        }
    }

    Ok(())
}
