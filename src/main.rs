use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use alloy::providers::RootProvider;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pairbot::api::{self, AppState};
use pairbot::config::{self, Config, Environment};
use pairbot::constants::{
    CHAIN_ID_BASE, CLEANUP_INTERVAL_SECS, DEFAULT_V2_SWAPPER, GAS_REFRESH_INTERVAL_SECS,
    PAIR_IDLE_EVICT_SECS, RECONCILE_INTERVAL_SECS, SNAPSHOT_INTERVAL_SECS,
};
use pairbot::core::aggregator::PairBook;
use pairbot::core::engine::IngestEngine;
use pairbot::core::feed::{FeedClient, FeedMessage};
use pairbot::core::policy::ScratchSpace;
use pairbot::core::state::{GasSnapshot, RuntimeState};
use pairbot::core::trade_manager::TradeManager;
use pairbot::execution::chain::ChainClient;
use pairbot::execution::swap::SwapRouter;
use pairbot::logging;
use pairbot::storage::TradeStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    // A missing wallet key is the one failure we report before logging is up.
    let env = match config::environment_from_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing — hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&env.log_dir)?;

    let config_path = PathBuf::from(&env.config_path);
    let config = config::load_config(&config_path)?;

    // -----------------------------------------------------------------------
    // Signer and chain client
    // -----------------------------------------------------------------------

    let key = env.private_key.strip_prefix("0x").unwrap_or(&env.private_key);
    let signer: PrivateKeySigner = key.parse().context("failed to parse PRIVATE_KEY")?;
    let wallet = signer.address();

    let rpc_url: Url = env.rpc_url.parse().context("failed to parse RPC_URL")?;
    let provider = RootProvider::new_http(rpc_url);
    let chain = Arc::new(ChainClient::new(provider, signer, CHAIN_ID_BASE));

    log_startup_summary(&env, &config, wallet);

    match chain.native_balance(wallet).await {
        Ok(balance) => {
            let eth = pairbot::execution::swap::raw_to_readable(balance, 18);
            info!(balance_eth = eth, "wallet balance");
            if balance < U256::from(1_000_000_000_000_000u64) {
                warn!(balance_eth = eth, "native balance below 0.001 — swaps may fail on gas");
            }
        }
        Err(e) => warn!(error = %e, "could not read native balance at startup"),
    }

    // -----------------------------------------------------------------------
    // Component construction
    // -----------------------------------------------------------------------

    let state = Arc::new(RuntimeState::new(wallet));

    let v2_swapper: Address = config
        .v2_swapper
        .as_deref()
        .map(|s| s.parse().context("failed to parse v2_swapper address"))
        .transpose()?
        .unwrap_or(DEFAULT_V2_SWAPPER);
    let router = Arc::new(SwapRouter::new(chain.clone(), v2_swapper));

    let store = TradeStore::new(&env.trades_path, &env.trade_log_path);
    let trades = Arc::new(TradeManager::new(
        chain.clone(),
        router,
        store,
        state.clone(),
    ));

    let pairs = Arc::new(StdRwLock::new(PairBook::new()));
    let scratch = Arc::new(ScratchSpace::new());
    let config = Arc::new(StdRwLock::new(config));
    let shutdown = CancellationToken::new();

    // -----------------------------------------------------------------------
    // Restore persisted trades and reconcile against the chain
    // -----------------------------------------------------------------------

    let open = trades.load_persisted()?;
    if open > 0 {
        match trades.reconcile().await {
            Ok(corrected) => info!(open, corrected, "startup reconciliation complete"),
            Err(e) => warn!(error = %e, "startup reconciliation failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Runtime tasks
    // -----------------------------------------------------------------------

    let (feed_tx, feed_rx) = mpsc::channel::<FeedMessage>(1024);

    let chains = config.read().expect("config lock").chains.clone();
    let feed = FeedClient::new(env.server_url.clone(), chains, feed_tx, shutdown.clone());
    let feed_handle = tokio::spawn(async move {
        if let Err(e) = feed.run().await {
            error!(error = %e, "feed client exited with error");
        }
    });

    let engine = IngestEngine::new(
        pairs.clone(),
        trades.clone(),
        scratch.clone(),
        state.clone(),
        config.clone(),
        feed_rx,
        shutdown.clone(),
    );
    let engine_handle = tokio::spawn(engine.run());

    let timers_handle = tokio::spawn(run_timers(
        chain.clone(),
        trades.clone(),
        pairs.clone(),
        scratch.clone(),
        state.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    // Control server — loopback only.
    let app_state = AppState {
        config: config.clone(),
        config_path,
        pairs: pairs.clone(),
        trades: trades.clone(),
        state: state.clone(),
    };
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", env.control_port))
        .await
        .with_context(|| format!("failed to bind control port {}", env.control_port))?;
    info!(port = env.control_port, "control api listening");

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, api::router(app_state))
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "control server exited with error");
        }
    });

    info!("agent running — press Ctrl+C to shut down");

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutdown signal received");
    shutdown.cancel();

    // Open positions are left open on purpose; they are reconciled on the
    // next start.
    for trade in trades.active_trades() {
        info!(
            pair = %trade.pair_address,
            symbol = %trade.symbol,
            tokens = trade.tokens_in_possession,
            eth_value = trade.current_eth_value,
            "open position at shutdown"
        );
    }
    trades.write_snapshot();

    let (feed_res, engine_res, timers_res, server_res) =
        tokio::join!(feed_handle, engine_handle, timers_handle, server_handle);
    for (name, res) in [
        ("feed", feed_res),
        ("engine", engine_res),
        ("timers", timers_res),
        ("server", server_res),
    ] {
        if let Err(e) = res {
            error!(task = name, error = %e, "task panicked");
        }
    }

    info!("shutdown complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Periodic maintenance
// ---------------------------------------------------------------------------

/// Gas refresh, group retention, balance reconciliation, and the snapshot +
/// heartbeat tick, all on one task.
async fn run_timers(
    chain: Arc<ChainClient>,
    trades: Arc<TradeManager>,
    pairs: Arc<StdRwLock<PairBook>>,
    scratch: Arc<ScratchSpace>,
    state: Arc<RuntimeState>,
    config: Arc<StdRwLock<Config>>,
    shutdown: CancellationToken,
) {
    let mut gas_tick = tokio::time::interval(Duration::from_secs(GAS_REFRESH_INTERVAL_SECS));
    let mut cleanup_tick = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
    let mut reconcile_tick = tokio::time::interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
    let mut snapshot_tick = tokio::time::interval(Duration::from_secs(SNAPSHOT_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            _ = gas_tick.tick() => {
                let fees = chain.fee_suggestion().await;
                state.set_gas(GasSnapshot {
                    max_fee_gwei: fees.max_fee as f64 / 1e9,
                    priority_fee_gwei: fees.priority_fee as f64 / 1e9,
                });
            }

            _ = cleanup_tick.tick() => {
                let max_groups = config.read().expect("config lock").max_groups;
                let now_ts = chrono::Utc::now().timestamp();
                let (_, evicted) = pairs.write().expect("pair book lock").cleanup(
                    max_groups,
                    PAIR_IDLE_EVICT_SECS,
                    now_ts,
                    |pair| trades.has_trade(pair),
                );
                for pair in evicted {
                    scratch.evict_pair(pair);
                }
            }

            _ = reconcile_tick.tick() => {
                if let Err(e) = trades.reconcile().await {
                    warn!(error = %e, "periodic reconciliation failed");
                }
            }

            _ = snapshot_tick.tick() => {
                trades.write_snapshot();
                let summary = trades.summary();
                info!(
                    pairs = pairs.read().expect("pair book lock").len(),
                    open = summary.open_trades,
                    closed = summary.closed_trades,
                    realized_pnl_eth = summary.realized_pnl_eth,
                    unrealized_pnl_eth = summary.unrealized_pnl_eth,
                    paused = state.is_paused(),
                    "heartbeat"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup logging
// ---------------------------------------------------------------------------

fn log_startup_summary(env: &Environment, config: &Config, wallet: Address) {
    let entries = config
        .policies
        .iter()
        .filter(|p| p.entry_predicate.is_some())
        .count();
    let exits = config
        .policies
        .iter()
        .filter(|p| p.exit_predicate.is_some())
        .count();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  pairbot {} — Base DEX trading agent", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!(wallet = %wallet, rpc = %env.rpc_url, "chain");
    info!(feed = %env.server_url, chains = ?config.chains, "market data");
    info!(
        config_path = %env.config_path,
        trades_path = %env.trades_path,
        trade_log = %env.trade_log_path,
        "paths"
    );
    info!(
        policies = config.policies.len(),
        entry_predicates = entries,
        exit_predicates = exits,
        max_eth_per_trade = config.max_eth_per_trade,
        max_positions = config.max_positions,
        group_interval_min = config.group_interval,
        "trading parameters"
    );
    info!(control_port = env.control_port, "control api");
    info!("═══════════════════════════════════════════════════════════════");
}
