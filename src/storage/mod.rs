//! Crash-safe trade persistence: an atomically rewritten JSON snapshot plus
//! an append-only JSONL audit log.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::AgentError;
use crate::types::{ActiveTrade, InactiveTrade, Summary, TradeLogEntry};

/// On-disk snapshot shape.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub active_trades: HashMap<Address, ActiveTrade>,
    #[serde(default)]
    pub inactive_trades: Vec<InactiveTrade>,
    /// Informational copy; recomputed from the trade sets on load.
    #[serde(default)]
    pub summary: Option<Summary>,
}

pub struct TradeStore {
    trades_path: PathBuf,
    log_path: PathBuf,
}

impl TradeStore {
    pub fn new(trades_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            trades_path: trades_path.into(),
            log_path: log_path.into(),
        }
    }

    /// Load the persisted snapshot.
    ///
    /// A missing file yields an empty state. The legacy flat form
    /// `{pair: trade}` is migrated in place: every entry becomes an active
    /// trade and any `summary` key is discarded.
    pub fn load_snapshot(&self) -> Result<Snapshot, AgentError> {
        self.load_snapshot_inner()
            .map_err(|e| AgentError::Persistence {
                reason: format!("loading {}: {e}", self.trades_path.display()),
            })
    }

    fn load_snapshot_inner(&self) -> Result<Snapshot, AgentError> {
        let contents = match std::fs::read_to_string(&self.trades_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.trades_path.display(), "no trade snapshot found");
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_str(&contents)?;
        if value.get("active_trades").is_some() {
            return Ok(serde_json::from_value(value)?);
        }

        // Legacy flat form.
        let mut snapshot = Snapshot::default();
        if let serde_json::Value::Object(map) = value {
            for (key, entry) in map {
                if key == "summary" {
                    continue;
                }
                let Ok(pair) = key.parse::<Address>() else {
                    warn!(key, "skipping unparseable key in legacy snapshot");
                    continue;
                };
                match serde_json::from_value::<ActiveTrade>(entry) {
                    Ok(trade) => {
                        snapshot.active_trades.insert(pair, trade);
                    }
                    Err(e) => warn!(%pair, error = %e, "skipping unparseable legacy trade"),
                }
            }
        }
        info!(
            migrated = snapshot.active_trades.len(),
            "migrated legacy trade snapshot"
        );
        Ok(snapshot)
    }

    /// Rewrite the snapshot atomically: temp file in the same directory,
    /// then rename over the old file.
    pub fn write_snapshot(
        &self,
        active: &HashMap<Address, ActiveTrade>,
        inactive: &[InactiveTrade],
        summary: &Summary,
    ) -> Result<(), AgentError> {
        self.write_snapshot_inner(active, inactive, summary)
            .map_err(|e| AgentError::Persistence {
                reason: format!("writing {}: {e}", self.trades_path.display()),
            })
    }

    fn write_snapshot_inner(
        &self,
        active: &HashMap<Address, ActiveTrade>,
        inactive: &[InactiveTrade],
        summary: &Summary,
    ) -> Result<(), AgentError> {
        if let Some(parent) = self.trades_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let snapshot = Snapshot {
            active_trades: active.clone(),
            inactive_trades: inactive.to_vec(),
            summary: Some(summary.clone()),
        };
        let tmp = self.trades_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, &self.trades_path)?;
        Ok(())
    }

    /// Append one line to the trade log. Log failures are reported, never
    /// fatal — the in-memory state of record keeps running.
    pub fn append_log(&self, entry: &TradeLogEntry) {
        if let Err(e) = self.try_append_log(entry) {
            warn!(error = %e, "failed to append trade log entry");
        }
    }

    fn try_append_log(&self, entry: &TradeLogEntry) -> Result<(), AgentError> {
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }
}
