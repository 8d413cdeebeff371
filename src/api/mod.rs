//! Local HTTP control surface, bound to the loopback interface only.

pub mod handlers;

pub use handlers::AppState;

use axum::routing::{get, post};
use axum::Router;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/trades", get(handlers::trades))
        .route("/balances", get(handlers::balances))
        .route("/config", get(handlers::get_config).post(handlers::update_config))
        .route("/pause", post(handlers::pause))
        .route("/resume", post(handlers::resume))
        .route("/sell", post(handlers::sell))
        .route("/sell-all", post(handlers::sell_all))
        .route("/buy", post(handlers::buy))
        .fallback(handlers::not_found)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::aggregator::PairBook;
    use crate::core::state::RuntimeState;
    use crate::core::trade_manager::TradeManager;
    use crate::execution::chain::{ChainClient, HttpProvider};
    use crate::execution::swap::SwapRouter;
    use crate::storage::TradeStore;
    use alloy::primitives::Address;
    use alloy::signers::local::PrivateKeySigner;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::{Arc, RwLock as StdRwLock};
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> AppState {
        let provider = HttpProvider::new_http("http://127.0.0.1:1".parse().unwrap());
        let signer = PrivateKeySigner::random();
        let wallet = signer.address();
        let chain = Arc::new(ChainClient::new(provider, signer, 8453));
        let router = Arc::new(SwapRouter::new(chain.clone(), Address::ZERO));
        let store = TradeStore::new(dir.join("trades.json"), dir.join("log.jsonl"));
        let state = Arc::new(RuntimeState::new(wallet));
        let trades = Arc::new(TradeManager::new(chain, router, store, state.clone()));
        AppState {
            config: Arc::new(StdRwLock::new(Config::default())),
            config_path: dir.join("agent.json"),
            pairs: Arc::new(StdRwLock::new(PairBook::new())),
            trades,
            state,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_reports_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));
        let (status, body) = send(
            app,
            Request::builder().uri("/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], false);
        assert_eq!(body["pairs"], 0);
        assert!(body["wallet"].as_str().unwrap().starts_with("0x"));
        assert!(body["summary"]["open_trades"].is_number());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));
        let (status, body) = send(
            app,
            Request::builder().uri("/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn pause_then_status_shows_paused() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let (status, body) = send(router(state.clone()), post_json("/pause", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], true);

        let (_, body) = send(
            router(state),
            Request::builder().uri("/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body["paused"], true);
    }

    #[tokio::test]
    async fn sell_validates_input() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        // Malformed body.
        let (status, _) = send(router(state.clone()), post_json("/sell", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Percent out of range.
        let (status, _) = send(
            router(state.clone()),
            post_json(
                "/sell",
                r#"{"pair":"0x00000000000000000000000000000000000000aa","percent":0}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No such trade.
        let (status, _) = send(
            router(state),
            post_json(
                "/sell",
                r#"{"pair":"0x00000000000000000000000000000000000000aa","percent":50}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn buy_unknown_pair_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));
        let (status, _) = send(
            app,
            post_json(
                "/buy",
                r#"{"pair":"0x00000000000000000000000000000000000000aa","ethAmount":0.01}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn buy_with_open_trade_is_409() {
        use crate::types::{ActiveTrade, Protocol};
        use alloy::primitives::U256;
        use std::collections::HashMap;

        let tmp = tempfile::tempdir().unwrap();
        let pair: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();

        // Seed a snapshot on disk, then load it the way a restart would.
        let trade = ActiveTrade {
            pair_address: pair,
            token0: crate::constants::WETH,
            token1: "0x00000000000000000000000000000000000000bb".parse().unwrap(),
            token0_decimals: 18,
            token1_decimals: 18,
            protocol: Protocol::V3,
            fork: "uniswap".into(),
            fee: 0.3,
            tick_spacing: None,
            hooks: None,
            symbol: "TKN".into(),
            base_token: crate::constants::WETH,
            policy_id: "p1".into(),
            entry_price: 1.0,
            eth_spent: 0.01,
            eth_sold: 0.0,
            tokens_bought: 1000.0,
            tokens_in_possession: 1000.0,
            tokens_in_possession_raw: U256::from(1000u64),
            current_price: 1.0,
            price_change_pct: 0.0,
            min_price_since_entry: 1.0,
            max_price_since_entry: 1.0,
            current_eth_value: 1000.0,
            opened_at: 0,
        };
        let mut active = HashMap::new();
        active.insert(pair, trade);
        TradeStore::new(tmp.path().join("trades.json"), tmp.path().join("log.jsonl"))
            .write_snapshot(&active, &[], &Default::default())
            .unwrap();

        let state = test_state(tmp.path());
        state.trades.load_persisted().unwrap();

        let (status, body) = send(
            router(state),
            post_json(
                "/buy",
                r#"{"pair":"0x00000000000000000000000000000000000000aa","ethAmount":0.01}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("open trade"));
    }

    #[tokio::test]
    async fn config_update_whitelist() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        // Whitelisted key applies and persists.
        let (status, body) = send(
            router(state.clone()),
            post_json("/config", r#"{"max_positions": 9}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max_positions"], 9);
        assert_eq!(state.config.read().unwrap().max_positions, 9);
        assert!(state.config_path.exists());

        // Non-whitelisted key is rejected.
        let (status, _) = send(
            router(state.clone()),
            post_json("/config", r#"{"policies": []}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Invalid value fails validation before persisting.
        let (status, _) = send(
            router(state.clone()),
            post_json("/config", r#"{"group_interval": 0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.config.read().unwrap().group_interval, 1);
    }

    #[tokio::test]
    async fn get_config_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));
        let (status, body) = send(
            app,
            Request::builder().uri("/config").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max_eth_per_trade"], 0.01);
        assert_eq!(body["chains"][0], "base_v3");
    }
}
