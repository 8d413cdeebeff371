pub mod types;
pub mod validate;

pub use types::*;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::info;

use crate::constants;
use crate::errors::AgentError;

/// Load the agent config from `path` and validate it.
///
/// A missing file yields the defaults (and is logged); a present but
/// malformed file refuses to start rather than silently trading on defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str::<Config>(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading config file {}", path.display()))
        }
    };

    validate::validate_config(&config).context("config validation")?;
    Ok(config)
}

/// Persist the config atomically: write a sibling temp file, then rename.
pub fn save_config(config: &Config, path: &Path) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(config)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Gather runtime settings from the process environment.
///
/// `PRIVATE_KEY` is the only hard requirement; everything else has a
/// default suitable for Base mainnet.
pub fn environment_from_env() -> Result<Environment> {
    let private_key = env_string("PRIVATE_KEY")
        .context("PRIVATE_KEY is required — refusing to start without a wallet key")?;

    Ok(Environment {
        private_key,
        rpc_url: env_string("RPC_URL").unwrap_or_else(|_| constants::DEFAULT_RPC_URL.into()),
        server_url: env_string("SERVER_URL")
            .unwrap_or_else(|_| "wss://feed.pairbot.dev/ws".into()),
        config_path: env_string("CONFIG_PATH").unwrap_or_else(|_| "config/agent.json".into()),
        trades_path: env_string("TRADES_PATH").unwrap_or_else(|_| "data/trades.json".into()),
        trade_log_path: env_string("TRADE_LOG_PATH")
            .unwrap_or_else(|_| "data/trade_log.jsonl".into()),
        control_port: env_parse("CONTROL_PORT").unwrap_or(8787),
        log_dir: env_string("LOG_DIR").unwrap_or_else(|_| "logs".into()),
    })
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => anyhow::bail!("missing env var {key}"),
    }
}

/// Read a non-empty env var and parse it as `T`.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config(&tmp.path().join("nope.json")).unwrap();
        assert_eq!(config.max_positions, 5);
        assert_eq!(config.chains, vec!["base_v3", "base_v4"]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.json");
        std::fs::write(&path, r#"{"max_eth_per_trade": 0.05}"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.max_eth_per_trade, 0.05);
        assert_eq!(config.group_interval, 1);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.json");
        let mut config = Config::default();
        config.max_positions = 9;
        config.policies.push(Policy {
            id: "breakout".into(),
            entry_predicate: Some("group.price_change_pct > 25".into()),
            exit_predicate: Some("trade.price_change_pct < -10".into()),
        });
        save_config(&config, &path).unwrap();
        let back = load_config(&path).unwrap();
        assert_eq!(back.max_positions, 9);
        assert_eq!(back.policies.len(), 1);
        assert_eq!(back.policies[0].id, "breakout");
    }

    #[test]
    #[serial]
    fn environment_requires_private_key() {
        std::env::remove_var("PRIVATE_KEY");
        assert!(environment_from_env().is_err());

        std::env::set_var("PRIVATE_KEY", "0xabc123");
        let env = environment_from_env().unwrap();
        assert_eq!(env.control_port, 8787);
        assert_eq!(env.rpc_url, constants::DEFAULT_RPC_URL);
        std::env::remove_var("PRIVATE_KEY");
    }

    #[test]
    #[serial]
    fn environment_honors_overrides() {
        std::env::set_var("PRIVATE_KEY", "0xabc123");
        std::env::set_var("CONTROL_PORT", "9999");
        std::env::set_var("RPC_URL", "https://rpc.example.org");
        let env = environment_from_env().unwrap();
        assert_eq!(env.control_port, 9999);
        assert_eq!(env.rpc_url, "https://rpc.example.org");
        for key in ["PRIVATE_KEY", "CONTROL_PORT", "RPC_URL"] {
            std::env::remove_var(key);
        }
    }
}
