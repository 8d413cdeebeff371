//! Shared runtime state: pause flag, USD rate cache, and the periodically
//! refreshed gas snapshot.
//!
//! Hot-path flags are atomics; the rate and gas caches sit behind std
//! read-write locks (they are tiny and never held across awaits).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use alloy::primitives::Address;
use tracing::{debug, info};

use crate::constants::TRACKED_RATE_ASSETS;

/// Gas view exposed to policies and the control API, in gwei.
#[derive(Debug, Clone, Copy, Default)]
pub struct GasSnapshot {
    pub max_fee_gwei: f64,
    pub priority_fee_gwei: f64,
}

pub struct RuntimeState {
    paused: AtomicBool,
    started_at: Instant,
    wallet: Address,
    /// USD rates per tracked asset symbol, fed by `usdRates_update`.
    prices: RwLock<HashMap<String, f64>>,
    gas: RwLock<GasSnapshot>,
}

impl RuntimeState {
    pub fn new(wallet: Address) -> Self {
        Self {
            paused: AtomicBool::new(false),
            started_at: Instant::now(),
            wallet,
            prices: RwLock::new(HashMap::new()),
            gas: RwLock::new(GasSnapshot::default()),
        }
    }

    pub fn wallet(&self) -> Address {
        self.wallet
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // -- pause ---------------------------------------------------------------

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        info!("agent paused — entries and exits inhibited");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        info!("agent resumed");
    }

    // -- USD rates -----------------------------------------------------------

    /// Fold a `usdRates_update` payload into the cache, keeping only the
    /// tracked assets.
    pub fn update_rates(&self, rates: &serde_json::Value) {
        let Some(map) = rates.as_object() else {
            return;
        };
        let mut cache = self.prices.write().expect("rates lock poisoned");
        for asset in TRACKED_RATE_ASSETS {
            if let Some(rate) = map.get(asset).and_then(|v| v.as_f64()) {
                if rate > 0.0 {
                    cache.insert(asset.to_string(), rate);
                }
            }
        }
        debug!(tracked = cache.len(), "usd rates updated");
    }

    pub fn usd_rate(&self, asset: &str) -> Option<f64> {
        self.prices
            .read()
            .expect("rates lock poisoned")
            .get(asset)
            .copied()
    }

    /// WETH/USD, falling back to ETH/USD. Zero until a rate arrives.
    pub fn weth_usd(&self) -> f64 {
        self.usd_rate("WETH").or_else(|| self.usd_rate("ETH")).unwrap_or(0.0)
    }

    pub fn rates(&self) -> HashMap<String, f64> {
        self.prices.read().expect("rates lock poisoned").clone()
    }

    // -- gas -----------------------------------------------------------------

    pub fn set_gas(&self, snapshot: GasSnapshot) {
        *self.gas.write().expect("gas lock poisoned") = snapshot;
    }

    pub fn gas(&self) -> GasSnapshot {
        *self.gas.read().expect("gas lock poisoned")
    }
}
