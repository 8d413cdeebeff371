//! Control-plane request handlers.
//!
//! Status contract: 400 malformed input, 404 unknown pair/trade/route,
//! 409 lock conflicts and duplicate positions, 500 internal errors.

use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};

use alloy::primitives::Address;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::config::{self, validate::validate_config, Config};
use crate::core::aggregator::PairBook;
use crate::core::state::RuntimeState;
use crate::core::trade_manager::TradeManager;
use crate::errors::AgentError;

/// Config keys the control plane may update.
const CONFIG_WHITELIST: [&str; 7] = [
    "max_eth_per_trade",
    "slippage",
    "max_positions",
    "group_interval",
    "max_groups",
    "only_pairs",
    "exclude_pairs",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StdRwLock<Config>>,
    pub config_path: PathBuf,
    pub pairs: Arc<StdRwLock<PairBook>>,
    pub trades: Arc<TradeManager>,
    pub state: Arc<RuntimeState>,
}

/// JSON error envelope carrying the control-plane status mapping.
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::ControlInput(_) | AgentError::Config(_) => StatusCode::BAD_REQUEST,
            AgentError::NoSuchTrade { .. } | AgentError::UnknownPair { .. } => {
                StatusCode::NOT_FOUND
            }
            AgentError::LockHeld { .. } | AgentError::DuplicateTrade { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Read endpoints
// ---------------------------------------------------------------------------

pub async fn status(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "paused": app.state.is_paused(),
        "uptime_secs": app.state.uptime_secs(),
        "pairs": app.pairs.read().expect("pair book lock").len(),
        "wallet": format!("{:#x}", app.state.wallet()),
        "active_trades": app.trades.active_trades(),
        "summary": app.trades.summary(),
    }))
}

pub async fn trades(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "summary": app.trades.summary(),
        "open": app.trades.active_trades(),
        "closed": app.trades.inactive_trades(),
    }))
}

/// Force a reconciliation pass and report current positions.
pub async fn balances(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    let corrected = app.trades.reconcile().await?;
    let positions: Vec<Value> = app
        .trades
        .active_trades()
        .iter()
        .map(|t| {
            json!({
                "pair": format!("{:#x}", t.pair_address),
                "symbol": t.symbol,
                "token": format!("{:#x}", t.held_token()),
                "tokens_in_possession": t.tokens_in_possession,
                "tokens_in_possession_raw": t.tokens_in_possession_raw.to_string(),
                "current_eth_value": t.current_eth_value,
            })
        })
        .collect();
    Ok(Json(json!({ "corrected": corrected, "positions": positions })))
}

pub async fn get_config(State(app): State<AppState>) -> Json<Config> {
    Json(app.config.read().expect("config lock").clone())
}

// ---------------------------------------------------------------------------
// Config update
// ---------------------------------------------------------------------------

/// Merge whitelisted keys into the config, validate, persist, and apply.
pub async fn update_config(
    State(app): State<AppState>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Config>, ApiError> {
    let Json(patch) = body.map_err(|e| AgentError::ControlInput(e.to_string()))?;
    let Some(patch) = patch.as_object() else {
        return Err(AgentError::ControlInput("body must be a JSON object".into()).into());
    };

    let current = app.config.read().expect("config lock").clone();
    let mut merged = serde_json::to_value(&current).map_err(AgentError::from)?;
    for (key, value) in patch {
        if !CONFIG_WHITELIST.contains(&key.as_str()) {
            return Err(AgentError::ControlInput(format!("key not updatable: {key}")).into());
        }
        merged[key] = value.clone();
    }

    let updated: Config = serde_json::from_value(merged)
        .map_err(|e| AgentError::ControlInput(format!("invalid config value: {e}")))?;
    validate_config(&updated)?;

    config::save_config(&updated, &app.config_path)?;
    *app.config.write().expect("config lock") = updated.clone();
    info!(keys = ?patch.keys().collect::<Vec<_>>(), "config updated via control api");
    Ok(Json(updated))
}

// ---------------------------------------------------------------------------
// Pause / resume
// ---------------------------------------------------------------------------

pub async fn pause(State(app): State<AppState>) -> Json<Value> {
    app.state.pause();
    Json(json!({ "paused": true }))
}

pub async fn resume(State(app): State<AppState>) -> Json<Value> {
    app.state.resume();
    Json(json!({ "paused": false }))
}

// ---------------------------------------------------------------------------
// Manual trading
// ---------------------------------------------------------------------------

fn parse_pair(body: &Value) -> Result<Address, AgentError> {
    body.get("pair")
        .and_then(|p| p.as_str())
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| AgentError::ControlInput("missing or invalid pair address".into()))
}

pub async fn sell(
    State(app): State<AppState>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| AgentError::ControlInput(e.to_string()))?;
    let pair = parse_pair(&body)?;
    let percent = body
        .get("percent")
        .and_then(|p| p.as_f64())
        .ok_or_else(|| AgentError::ControlInput("missing or invalid percent".into()))?;
    if !(percent > 0.0 && percent <= 100.0) {
        return Err(AgentError::ControlInput(format!(
            "percent must be in (0, 100], got {percent}"
        ))
        .into());
    }

    let live_pair = app.pairs.read().expect("pair book lock").get(&pair).cloned();
    let result = app.trades.manual_sell(pair, percent, live_pair).await?;
    Ok(Json(json!({ "pair": format!("{pair:#x}"), "result": result })))
}

pub async fn sell_all(State(app): State<AppState>) -> Json<Value> {
    let mut results = Vec::new();
    for trade in app.trades.active_trades() {
        let pair = trade.pair_address;
        let live_pair = app.pairs.read().expect("pair book lock").get(&pair).cloned();
        let outcome = app.trades.manual_sell(pair, 100.0, live_pair).await;
        results.push(match outcome {
            Ok(result) => json!({ "pair": format!("{pair:#x}"), "ok": true, "result": result }),
            Err(e) => json!({ "pair": format!("{pair:#x}"), "ok": false, "error": e.to_string() }),
        });
    }
    Json(json!({ "results": results }))
}

pub async fn buy(
    State(app): State<AppState>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| AgentError::ControlInput(e.to_string()))?;
    let pair = parse_pair(&body)?;
    let eth_amount = body
        .get("ethAmount")
        .or_else(|| body.get("eth_amount"))
        .and_then(|v| v.as_f64())
        .ok_or_else(|| AgentError::ControlInput("missing or invalid ethAmount".into()))?;
    if eth_amount <= 0.0 {
        return Err(
            AgentError::ControlInput(format!("ethAmount must be positive, got {eth_amount}"))
                .into(),
        );
    }

    if app.trades.has_trade(pair) {
        return Err(AgentError::DuplicateTrade {
            pair: format!("{pair:#x}"),
        }
        .into());
    }

    let Some(pair_state) = app.pairs.read().expect("pair book lock").get(&pair).cloned() else {
        return Err(AgentError::UnknownPair {
            pair: format!("{pair:#x}"),
        }
        .into());
    };

    app.trades.manual_buy(&pair_state, eth_amount).await?;
    let trade = app.trades.get_trade(pair);
    Ok(Json(json!({ "pair": format!("{pair:#x}"), "trade": trade })))
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "unknown route" })),
    )
        .into_response()
}
