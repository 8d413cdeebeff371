use thiserror::Error;

/// Typed error hierarchy for the trading agent.
///
/// Library-internal errors use specific variants; application code wraps with
/// `anyhow::Context` for propagation.
#[derive(Error, Debug)]
pub enum AgentError {
    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Persistence --------------------------------------------------------
    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    // -- Network / RPC ------------------------------------------------------
    #[error("rpc error: {reason}")]
    Rpc { reason: String },

    #[error("transaction reverted: {tx_hash}")]
    TxReverted { tx_hash: String },

    // -- Policy -------------------------------------------------------------
    #[error("policy {policy_id} failed to compile: {reason}")]
    PolicyCompile { policy_id: String, reason: String },

    #[error("policy {policy_id} runtime error: {reason}")]
    PolicyRuntime { policy_id: String, reason: String },

    // -- Swap execution -----------------------------------------------------
    #[error("swap failed: {reason}")]
    Swap { reason: String },

    // -- Trade lifecycle ----------------------------------------------------
    #[error("no active trade for pair {pair}")]
    NoSuchTrade { pair: String },

    #[error("pair {pair} has an action in flight")]
    LockHeld { pair: String },

    #[error("pair {pair} already has an open trade")]
    DuplicateTrade { pair: String },

    #[error("pair {pair} is not known to the feed")]
    UnknownPair { pair: String },

    // -- Reconciliation -----------------------------------------------------
    #[error("reconciliation error: {reason}")]
    Reconciliation { reason: String },

    // -- Control plane ------------------------------------------------------
    #[error("invalid request: {0}")]
    ControlInput(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Transport(#[from] alloy::transports::TransportError),

    #[error(transparent)]
    Contract(#[from] alloy::contract::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
