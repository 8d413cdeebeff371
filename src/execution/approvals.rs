//! Approval manager — idempotent ERC-20 and Permit2 allowance top-ups.
//!
//! Allowances are never cached in memory: each path re-reads the current
//! value so externally revoked approvals are re-granted instead of causing
//! a revert downstream.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{aliases::U48, Address, Bytes, U160, U256};
use alloy::sol_types::SolCall;
use tracing::{debug, info, warn};

use crate::constants::{GAS_LIMIT_APPROVAL, PERMIT2, PERMIT2_EXPIRY_SECS, UNIVERSAL_ROUTER};
use crate::errors::AgentError;
use crate::execution::chain::{ChainClient, TxSpec};
use crate::execution::contracts::{IERC20, IPermit2};

const ALLOWANCE_READ_ATTEMPTS: u32 = 3;
const ALLOWANCE_READ_DELAY: Duration = Duration::from_secs(1);

pub struct ApprovalManager {
    chain: Arc<ChainClient>,
}

impl ApprovalManager {
    pub fn new(chain: Arc<ChainClient>) -> Self {
        Self { chain }
    }

    /// Make sure `spender` may pull at least `amount` of `token`.
    ///
    /// Grants `uint256::MAX` when topping up so the approval never needs to
    /// be repeated for this spender.
    pub async fn ensure_erc20_approval(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), AgentError> {
        let current = self.read_allowance(token, spender).await?;
        if current >= amount {
            debug!(%token, %spender, "erc20 allowance sufficient");
            return Ok(());
        }

        info!(%token, %spender, "submitting erc20 approval");
        let input = IERC20::approveCall {
            spender,
            amount: U256::MAX,
        }
        .abi_encode();

        self.chain
            .submit(&TxSpec {
                to: token,
                input: Bytes::from(input),
                value: U256::ZERO,
                gas_limit: GAS_LIMIT_APPROVAL,
            })
            .await?;
        Ok(())
    }

    /// Make sure the Universal Router may pull `amount` of `token` through
    /// Permit2, with an unexpired grant.
    pub async fn ensure_permit2_approval(
        &self,
        token: Address,
        amount: U256,
    ) -> Result<(), AgentError> {
        let permit2 = IPermit2::new(PERMIT2, self.chain.provider().clone());
        let grant = permit2
            .allowance(self.chain.owner(), token, UNIVERSAL_ROUTER)
            .call()
            .await?;

        let now = chrono::Utc::now().timestamp() as u64;
        let expiration: u64 = grant.expiration.to::<u64>();
        let granted = U256::from_be_slice(&grant.amount.to_be_bytes::<20>());
        if granted >= amount && expiration > now {
            debug!(%token, "permit2 allowance sufficient and unexpired");
            return Ok(());
        }

        info!(%token, "submitting permit2 approval");
        let input = IPermit2::approveCall {
            token,
            spender: UNIVERSAL_ROUTER,
            amount: U160::MAX,
            expiration: U48::from(now + PERMIT2_EXPIRY_SECS),
        }
        .abi_encode();

        self.chain
            .submit(&TxSpec {
                to: PERMIT2,
                input: Bytes::from(input),
                value: U256::ZERO,
                gas_limit: GAS_LIMIT_APPROVAL,
            })
            .await?;
        Ok(())
    }

    /// Read the current allowance, retrying transient failures.
    async fn read_allowance(&self, token: Address, spender: Address) -> Result<U256, AgentError> {
        let erc20 = IERC20::new(token, self.chain.provider().clone());
        let mut last = None;
        for attempt in 1..=ALLOWANCE_READ_ATTEMPTS {
            match erc20.allowance(self.chain.owner(), spender).call().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(error = %e, attempt, %token, "allowance read failed");
                    last = Some(e);
                    if attempt < ALLOWANCE_READ_ATTEMPTS {
                        tokio::time::sleep(ALLOWANCE_READ_DELAY).await;
                    }
                }
            }
        }
        Err(last.expect("at least one attempt ran").into())
    }
}
