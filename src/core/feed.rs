//! Feed client: persistent websocket connection to the market-data server.
//!
//! On connect it subscribes to the configured chain tags, then forwards
//! normalized event envelopes to the ingest task. Reconnects forever with
//! exponential backoff (1 s base, 10 s cap); the server acking the
//! subscription is log-only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Feed events relevant downstream.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// A `marketData` payload, still in wire shape.
    Market(Value),
    /// A `usdRates_update` payload.
    UsdRates(Value),
}

#[derive(Default)]
pub struct FeedStats {
    pub market_events: AtomicU64,
    pub rate_updates: AtomicU64,
    pub dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

pub struct FeedClient {
    url: String,
    chains: Vec<String>,
    tx: mpsc::Sender<FeedMessage>,
    shutdown: CancellationToken,
    stats: Arc<FeedStats>,
}

impl FeedClient {
    pub fn new(
        url: String,
        chains: Vec<String>,
        tx: mpsc::Sender<FeedMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url,
            chains,
            tx,
            shutdown,
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    /// Main run loop with automatic reconnection. Only shutdown ends it.
    pub async fn run(&self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.connect_and_process().await {
                Ok(_) => break, // clean shutdown inside the loop
                Err(e) => {
                    attempt += 1;
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        next_retry_ms = delay.as_millis() as u64,
                        "feed disconnected, reconnecting"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }
        }

        info!(
            market_events = self.stats.market_events.load(Ordering::Relaxed),
            rate_updates = self.stats.rate_updates.load(Ordering::Relaxed),
            dropped = self.stats.dropped.load(Ordering::Relaxed),
            reconnects = self.stats.reconnects.load(Ordering::Relaxed),
            "feed client stopped"
        );
        Ok(())
    }

    async fn connect_and_process(&self) -> Result<()> {
        info!(url = %self.url, "connecting to feed");
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("feed connection failed")?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = subscribe_message(&self.chains);
        write
            .send(Message::Text(subscribe.to_string().into()))
            .await
            .context("subscribe send failed")?;
        info!(chains = ?self.chains, "subscribed to market data");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("server closed the connection: {frame:?}");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => anyhow::bail!("feed read error: {e}"),
                        None => anyhow::bail!("feed stream ended"),
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        match parse_feed_message(text) {
            Ok(Some(FeedMessage::Market(v))) => {
                self.stats.market_events.fetch_add(1, Ordering::Relaxed);
                if self.tx.send(FeedMessage::Market(v)).await.is_err() {
                    warn!("ingest channel closed, dropping market event");
                }
            }
            Ok(Some(FeedMessage::UsdRates(v))) => {
                self.stats.rate_updates.fetch_add(1, Ordering::Relaxed);
                let _ = self.tx.send(FeedMessage::UsdRates(v)).await;
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "unparseable feed frame");
            }
        }
    }
}

/// Delay before reconnect attempt `n` (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1).min(4));
    exp.min(BACKOFF_CAP)
}

/// The client → server subscription frame.
fn subscribe_message(chains: &[String]) -> Value {
    serde_json::json!({
        "event": "subscribeMarketData",
        "data": { "chains": chains },
    })
}

/// Classify one wire frame. `Ok(None)` for frames that are log-only or
/// irrelevant (acks, unknown events).
pub fn parse_feed_message(text: &str) -> Result<Option<FeedMessage>> {
    let value: Value = serde_json::from_str(text).context("invalid JSON frame")?;
    let event = value
        .get("event")
        .and_then(|e| e.as_str())
        .context("frame missing event field")?;

    match event {
        "marketData" => Ok(Some(FeedMessage::Market(value))),
        "usdRates_update" => Ok(Some(FeedMessage::UsdRates(
            value.get("data").cloned().unwrap_or(Value::Null),
        ))),
        "subscribeMarketDataAck" => {
            info!(data = ?value.get("data"), "market data subscription acknowledged");
            Ok(None)
        }
        other => {
            debug!(event = other, "ignoring unknown feed event");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_frames_pass_through() {
        let text = r#"{"event":"marketData","data":{"pairAddress":"0x00000000000000000000000000000000000000aa","lastPrice":1.0}}"#;
        match parse_feed_message(text).unwrap() {
            Some(FeedMessage::Market(v)) => {
                assert_eq!(v["data"]["lastPrice"], 1.0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rate_frames_carry_only_data() {
        let text = r#"{"event":"usdRates_update","data":{"WETH":3200.0}}"#;
        match parse_feed_message(text).unwrap() {
            Some(FeedMessage::UsdRates(v)) => assert_eq!(v["WETH"], 3200.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn acks_and_unknown_events_are_dropped() {
        let ack = r#"{"event":"subscribeMarketDataAck","data":{"chains":["base_v3"]}}"#;
        assert!(parse_feed_message(ack).unwrap().is_none());
        let unknown = r#"{"event":"heartbeat"}"#;
        assert!(parse_feed_message(unknown).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_error() {
        assert!(parse_feed_message("not json").is_err());
        assert!(parse_feed_message(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn backoff_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(50), Duration::from_secs(10));
    }

    #[test]
    fn subscribe_frame_shape() {
        let frame = subscribe_message(&["base_v3".into(), "base_v4".into()]);
        assert_eq!(frame["event"], "subscribeMarketData");
        assert_eq!(frame["data"]["chains"][1], "base_v4");
    }
}
