//! Chain client — RPC reads, EIP-1559 fee estimation, nonce issue, and
//! retrying raw-transaction submission.
//!
//! Signs locally and submits raw bytes; the nonce counter is issued
//! strictly monotonically behind an async mutex and re-synced from chain
//! when the RPC reports it stale.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::transports::{RpcError, TransportError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{
    FALLBACK_MAX_FEE_WEI, FALLBACK_PRIORITY_FEE_WEI, FEE_HEADROOM, MIN_PRIORITY_FEE_WEI,
};
use crate::errors::AgentError;
use crate::execution::contracts::IERC20;

/// Concrete provider type: Alloy HTTP provider over Ethereum network.
pub type HttpProvider = RootProvider;

/// Sleep between attempts after a generic network error.
const NETWORK_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Submission attempts per transaction.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// A transaction ready for fee/nonce assignment and signing.
#[derive(Debug, Clone)]
pub struct TxSpec {
    pub to: Address,
    pub input: Bytes,
    pub value: U256,
    pub gas_limit: u64,
}

/// Current fee suggestion in wei.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeSuggestion {
    pub max_fee: u128,
    pub priority_fee: u128,
}

enum SubmitFailure {
    StaleNonce,
    Network,
    Terminal,
}

pub struct ChainClient {
    provider: HttpProvider,
    signer: PrivateKeySigner,
    owner: Address,
    chain_id: u64,
    /// Async-safe nonce counter. `None` until first chain query.
    nonce: Mutex<Option<u64>>,
}

impl ChainClient {
    pub fn new(provider: HttpProvider, signer: PrivateKeySigner, chain_id: u64) -> Self {
        let owner = signer.address();
        info!(address = %owner, chain_id, "chain client initialized");
        Self {
            provider,
            signer,
            owner,
            chain_id,
            nonce: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn provider(&self) -> &HttpProvider {
        &self.provider
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn balance_of(&self, token: Address, owner: Address) -> Result<U256, AgentError> {
        let erc20 = IERC20::new(token, self.provider.clone());
        Ok(erc20.balanceOf(owner).call().await?)
    }

    pub async fn native_balance(&self, owner: Address) -> Result<U256, AgentError> {
        Ok(self.provider.get_balance(owner).await?)
    }

    pub async fn decimals(&self, token: Address) -> Result<u8, AgentError> {
        let erc20 = IERC20::new(token, self.provider.clone());
        Ok(erc20.decimals().call().await?)
    }

    /// `eth_call` against current state. Used for pre-submit simulation.
    pub async fn static_call(&self, to: Address, input: Bytes) -> Result<Bytes, AgentError> {
        let tx = TransactionRequest::default()
            .with_from(self.owner)
            .with_to(to)
            .with_input(input);
        Ok(self.provider.call(tx).await?)
    }

    // -----------------------------------------------------------------------
    // Fees and nonces
    // -----------------------------------------------------------------------

    /// Fee suggestion for a type-2 transaction.
    ///
    /// Base is the latest reported gas price; the priority fee is floored at
    /// 0.01 gwei and at 10% of base; both carry 1% headroom. Falls back to
    /// fixed conservative values when the RPC refuses to quote.
    pub async fn fee_suggestion(&self) -> FeeSuggestion {
        let base = match self.provider.get_gas_price().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "gas price query failed, using fallback fees");
                return FeeSuggestion {
                    max_fee: FALLBACK_MAX_FEE_WEI,
                    priority_fee: FALLBACK_PRIORITY_FEE_WEI,
                };
            }
        };
        let reported_priority = self
            .provider
            .get_max_priority_fee_per_gas()
            .await
            .unwrap_or(0);

        let (max_fee, priority_fee) = shape_fees(base, reported_priority);
        FeeSuggestion {
            max_fee,
            priority_fee,
        }
    }

    /// Issue the next nonce, initialising from pending state on first call.
    pub async fn next_nonce(&self) -> Result<u64, AgentError> {
        let mut guard = self.nonce.lock().await;
        let nonce = match *guard {
            Some(n) => n,
            None => {
                let n = self
                    .provider
                    .get_transaction_count(self.owner)
                    .pending()
                    .await?;
                info!(nonce = n, "nonce initialized from chain");
                n
            }
        };
        *guard = Some(nonce + 1);
        Ok(nonce)
    }

    /// Re-sync the nonce counter from the latest block.
    async fn recover_nonce(&self) -> Result<(), AgentError> {
        let mut guard = self.nonce.lock().await;
        let chain_nonce = self.provider.get_transaction_count(self.owner).await?;
        let old = *guard;
        *guard = Some(chain_nonce);
        warn!(old_nonce = ?old, chain_nonce, "nonce recovered from chain");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Sign and submit `spec`, waiting for the receipt.
    ///
    /// Up to three attempts. A stale-nonce response re-syncs the counter and
    /// retries; a transport error sleeps 250 ms and retries; anything else is
    /// terminal. Fees are rebuilt on every attempt so a resubmit reflects
    /// current gas.
    pub async fn submit(&self, spec: &TxSpec) -> Result<TransactionReceipt, AgentError> {
        let mut last_error: Option<TransportError> = None;

        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            let fees = self.fee_suggestion().await;
            let nonce = self.next_nonce().await?;
            let raw = self.sign_raw(spec, nonce, fees)?;

            match self.provider.send_raw_transaction(&raw).await {
                Ok(pending) => {
                    let tx_hash = *pending.tx_hash();
                    info!(
                        tx_hash = %tx_hash,
                        nonce,
                        max_fee = fees.max_fee,
                        priority_fee = fees.priority_fee,
                        gas_limit = spec.gas_limit,
                        attempt,
                        "transaction submitted"
                    );
                    return self.wait_for_receipt(tx_hash).await;
                }
                Err(e) => match classify_submit_error(&e) {
                    SubmitFailure::StaleNonce => {
                        warn!(error = %e, attempt, "stale nonce, re-syncing");
                        self.recover_nonce().await?;
                        last_error = Some(e);
                    }
                    SubmitFailure::Network => {
                        warn!(error = %e, attempt, "network error, retrying");
                        tokio::time::sleep(NETWORK_RETRY_DELAY).await;
                        last_error = Some(e);
                    }
                    SubmitFailure::Terminal => return Err(e.into()),
                },
            }
        }

        Err(AgentError::Rpc {
            reason: format!(
                "submission failed after {MAX_SUBMIT_ATTEMPTS} attempts: {}",
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".into())
            ),
        })
    }

    /// Poll for a receipt until the transaction is mined.
    ///
    /// An in-flight submission is never abandoned; a mined-but-reverted
    /// transaction is an error.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TransactionReceipt, AgentError> {
        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if !receipt.status() {
                        return Err(AgentError::TxReverted {
                            tx_hash: tx_hash.to_string(),
                        });
                    }
                    debug!(tx_hash = %tx_hash, gas_used = receipt.gas_used, "transaction confirmed");
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, tx_hash = %tx_hash, "receipt poll error, retrying");
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn sign_raw(&self, spec: &TxSpec, nonce: u64, fees: FeeSuggestion) -> Result<Vec<u8>, AgentError> {
        let tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit: spec.gas_limit,
            max_fee_per_gas: fees.max_fee,
            max_priority_fee_per_gas: fees.priority_fee,
            to: TxKind::Call(spec.to),
            value: spec.value,
            access_list: Default::default(),
            input: spec.input.clone(),
        };

        let sig_hash = tx.signature_hash();
        let sig = self
            .signer
            .sign_hash_sync(&sig_hash)
            .map_err(|e| AgentError::Rpc {
                reason: format!("transaction signing failed: {e}"),
            })?;

        let envelope = TxEnvelope::Eip1559(tx.into_signed(sig));
        Ok(envelope.encoded_2718())
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Shape `(max_fee, priority_fee)` from the raw gas price and reported
/// priority fee.
fn shape_fees(base: u128, reported_priority: u128) -> (u128, u128) {
    let priority = MIN_PRIORITY_FEE_WEI
        .max(reported_priority)
        .max(base / 10);
    let max_fee = (base as f64 * FEE_HEADROOM) as u128;
    let priority = (priority as f64 * FEE_HEADROOM) as u128;
    // A priority fee above max_fee would be rejected outright.
    (max_fee.max(priority), priority)
}

fn classify_submit_error(e: &TransportError) -> SubmitFailure {
    match e {
        RpcError::ErrorResp(payload) => {
            if is_stale_nonce_message(&payload.message) {
                SubmitFailure::StaleNonce
            } else {
                SubmitFailure::Terminal
            }
        }
        RpcError::Transport(_) | RpcError::NullResp => SubmitFailure::Network,
        _ => SubmitFailure::Terminal,
    }
}

fn is_stale_nonce_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("nonce too low") || m.contains("nonce expired")
}
