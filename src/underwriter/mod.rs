//! Underwriter pipeline (§4.F): Eval queue decides whether a swap is worth
//! underwriting, Submit queue dispatches the `underwrite` call through the
//! wallet. Two `ProcessingQueue` instances chained, reusing the one generic
//! queue type for both stages.

pub mod pricing;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::abi::{SwapUnderwrittenFilter, CATALYST_CHAIN_INTERFACE_ABI};
use crate::approval::{AllowanceIncrease, ApprovalHandler};
use crate::config::ResolvedChainConfig;
use crate::error::{Subsystem, UnderwriterError};
use crate::monitor::BlockTip;
use crate::queue::{HandleOutcome, OrderHandler, Outcome, QueueOrder};
use crate::store::{Store, StoreEvent, CHANNEL_SWAP_UNDERWRITTEN};
use crate::types::{UnderwriteId, UnderwriteKey, UnderwriteStatus};
use crate::wallet::{WalletHandle, WalletOptions, WalletOutcome, WalletTransactionRequest};
use pricing::PriceOracle;

/// Candidate swap handed to the eval queue as soon as the listener observes
/// `SendAsset` and the admission gate (§4.F "between stages") lets it through.
#[derive(Debug, Clone)]
pub struct EvalOrder {
    pub key: UnderwriteKey,
}

impl QueueOrder for EvalOrder {
    fn id(&self) -> String {
        self.key.store_key()
    }
}

/// Result of a successful eval: everything the submit stage needs to build
/// and send the `underwrite` call.
#[derive(Debug, Clone)]
pub struct UnderwriteOrder {
    pub key: UnderwriteKey,
    pub to_vault: Address,
    pub to_asset: Address,
    pub units: U256,
    pub min_out: U256,
    pub to_account: Address,
    pub underwrite_incentive_x16: u16,
    pub calldata: Bytes,
    pub to_asset_allowance: U256,
    pub deadline: std::time::Instant,
}

impl QueueOrder for UnderwriteOrder {
    fn id(&self) -> String {
        self.key.store_key()
    }
    fn deadline(&self) -> Option<Instant> {
        Some(self.deadline)
    }
}

pub struct EvalHandler {
    store: Arc<Store>,
    tip: watch::Receiver<BlockTip>,
    config: ResolvedChainConfig,
    oracle: Arc<dyn PriceOracle>,
}

impl EvalHandler {
    pub fn new(store: Arc<Store>, tip: watch::Receiver<BlockTip>, config: ResolvedChainConfig, oracle: Arc<dyn PriceOracle>) -> Self {
        Self { store, tip, config, oracle }
    }

    fn reject(&self, reason: impl Into<String>) -> UnderwriterError {
        UnderwriterError::Validation {
            subsystem: Subsystem::Eval,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl OrderHandler<EvalOrder> for EvalHandler {
    type Result = UnderwriteOrder;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Eval
    }

    async fn handle_order(
        &self,
        order: &EvalOrder,
        _retry_count: u32,
    ) -> Result<HandleOutcome<Self::Result>, UnderwriterError> {
        let state = self
            .store
            .get_active_underwrite_state(&order.key)
            .map_err(|e| UnderwriterError::Upstream { subsystem: Subsystem::Eval, reason: e.to_string() })?
            .ok_or_else(|| self.reject("swap not found in store"))?;

        // 2. already underwritten.
        if state.status != UnderwriteStatus::Pending {
            return Ok(HandleOutcome::Dropped);
        }

        // 3. profitability.
        let expected_out = self.oracle.expected_out(&state).await;
        let underwrite_reward = state
            .units
            .saturating_mul(U256::from(state.underwrite_incentive_x16))
            / U256::from(65_536u64);
        if underwrite_reward < self.config.min_underwrite_reward {
            return Ok(HandleOutcome::Dropped);
        }
        if !expected_out.is_zero() {
            let relative = underwrite_reward.as_u128() as f64 / expected_out.as_u128() as f64;
            if relative < self.config.relative_min_underwrite_reward {
                return Ok(HandleOutcome::Dropped);
            }
        }

        // 4. size cap.
        if state.units > self.config.max_underwrite_allowed {
            return Ok(HandleOutcome::Dropped);
        }

        // 5. timing: underwriteDelay + currentBlock must leave room before expiry margin.
        let current_block = self.tip.borrow().block_number;
        if current_block < state.event_block_number + self.config.underwrite_delay {
            // Not yet eligible; the admission pre-queue should not have let this
            // through, but treat it as a retryable upstream condition rather
            // than a hard reject.
            return Err(UnderwriterError::Upstream {
                subsystem: Subsystem::Eval,
                reason: "underwrite delay not yet elapsed".to_string(),
            });
        }
        let earliest_acceptable_underwrite_block = current_block + self.config.underwrite_delay;
        let latest_safe_underwrite_block = state.expiry_block.saturating_sub(self.config.underwrite_blocks_margin);
        if earliest_acceptable_underwrite_block > latest_safe_underwrite_block {
            return Ok(HandleOutcome::Dropped);
        }

        // 6. allowance.
        let allowance_bps = 10_000 + self.config.allowance_buffer_bps;
        let to_asset_allowance = expected_out.saturating_mul(U256::from(allowance_bps)) / U256::from(10_000u64);

        let order = UnderwriteOrder {
            key: state.key.clone(),
            to_vault: state.to_vault,
            to_asset: state.to_asset,
            units: state.units,
            min_out: state.min_out,
            to_account: state.to_account,
            underwrite_incentive_x16: state.underwrite_incentive_x16 as u16,
            calldata: state.calldata.clone(),
            to_asset_allowance,
            deadline: Instant::now() + std::time::Duration::from_millis(self.config.max_submission_delay_ms),
        };
        Ok(HandleOutcome::Settled(order))
    }
}

pub struct SubmitHandler {
    interface: Address,
    approval: Arc<ApprovalHandler>,
    wallet: WalletHandle,
    store: Arc<Store>,
}

impl SubmitHandler {
    pub fn new(interface: Address, approval: Arc<ApprovalHandler>, wallet: WalletHandle, store: Arc<Store>) -> Self {
        Self { interface, approval, wallet, store }
    }

    /// `underwrite()` only names its id as a function return value on-chain;
    /// the matching `SwapUnderwritten` log in the same receipt is how a
    /// caller without eth_call access to the return data learns it. Rekeys
    /// the swap record from the provisional `SendAsset`-derived key to this
    /// real one so the expirer's admission lookup (keyed on the real id) can
    /// find it, rather than waiting on the listener's independent log stream
    /// to race the same update.
    fn rekey_from_receipt(&self, provisional_key: &UnderwriteKey, receipt: &ethers::types::TransactionReceipt) {
        let Some(log) = receipt
            .logs
            .iter()
            .filter(|log| log.address == self.interface)
            .find_map(|log| ethers::contract::parse_log::<SwapUnderwrittenFilter>(log.clone()).ok())
        else {
            warn!(underwrite_id = %provisional_key.underwrite_id, "underwrite confirmed but no SwapUnderwritten log found to rekey from");
            return;
        };

        let real_key = UnderwriteKey {
            to_chain_id: provisional_key.to_chain_id,
            to_interface: provisional_key.to_interface,
            underwrite_id: UnderwriteId(ethers::types::H256::from(log.underwrite_id)),
        };
        let block = receipt.block_number.map(|n| n.as_u64()).unwrap_or(0);
        match self.store.rekey_swap_state(provisional_key, real_key.clone(), log.underwriter, log.expiry.as_u64(), block) {
            Ok(Some(_)) => self.store.publish(CHANNEL_SWAP_UNDERWRITTEN, StoreEvent::SwapUnderwritten(real_key)),
            Ok(None) => {}
            Err(e) => warn!(underwrite_id = %provisional_key.underwrite_id, error = %e, "failed to rekey swap state after underwrite"),
        }
    }
}

#[async_trait]
impl OrderHandler<UnderwriteOrder> for SubmitHandler {
    type Result = ();

    fn subsystem(&self) -> Subsystem {
        Subsystem::Wallet
    }

    async fn handle_order(
        &self,
        order: &UnderwriteOrder,
        _retry_count: u32,
    ) -> Result<HandleOutcome<Self::Result>, UnderwriterError> {
        self.approval
            .update_allowances(&[AllowanceIncrease {
                interface: self.interface,
                asset: order.to_asset,
                amount: order.to_asset_allowance,
            }])
            .await;

        let function = CATALYST_CHAIN_INTERFACE_ABI
            .function("underwrite")
            .expect("underwrite selector is part of the embedded ABI");
        let calldata = function
            .encode_input(&[
                ethers::abi::Token::Address(order.to_vault),
                ethers::abi::Token::Address(order.to_asset),
                ethers::abi::Token::Uint(order.units),
                ethers::abi::Token::Uint(order.min_out),
                ethers::abi::Token::Address(order.to_account),
                ethers::abi::Token::Uint(U256::from(order.underwrite_incentive_x16)),
                ethers::abi::Token::Bytes(order.calldata.to_vec()),
            ])
            .map_err(|e| UnderwriterError::Validation {
                subsystem: Subsystem::Wallet,
                reason: format!("failed to encode underwrite calldata: {e}"),
            })?;

        let tx_request = ethers::types::transaction::eip2718::TypedTransaction::Eip1559(
            ethers::types::transaction::eip1559::Eip1559TransactionRequest::new()
                .to(self.interface)
                .data(calldata),
        );

        let reply = self
            .wallet
            .submit(WalletTransactionRequest {
                tx_request,
                metadata: serde_json::to_value(order).unwrap_or_default(),
                options: WalletOptions {
                    retry_on_nonce_confirmation_error: true,
                },
            })
            .await
            .map_err(|e| UnderwriterError::Submission {
                subsystem: Subsystem::Wallet,
                reason: e.to_string(),
                unrecoverable: false,
            })?;

        match reply.outcome {
            WalletOutcome::Confirmed(receipt) => {
                self.approval
                    .register_allowance_use(self.interface, order.to_asset, order.to_asset_allowance);
                self.rekey_from_receipt(&order.key, &receipt);
                info!(underwrite_id = %order.key.underwrite_id, "underwrite confirmed");
                Ok(HandleOutcome::Settled(()))
            }
            WalletOutcome::SubmissionError(e) | WalletOutcome::ConfirmationError(e) => Err(e),
        }
    }

    async fn handle_failed_order(&self, order: &UnderwriteOrder, retry_count: u32, error: &UnderwriterError) -> bool {
        let should_retry = error.is_retryable();
        if !should_retry {
            warn!(underwrite_id = %order.key.underwrite_id, retry_count, "underwrite submission exhausted");
        }
        should_retry
    }

    /// Releases the allowance reserved for this order once it is finally
    /// rejected (i.e. retries exhausted, not on every individual attempt).
    async fn on_order_completion(&self, order: &UnderwriteOrder, outcome: &Outcome<Self::Result>, _retry_count: u32) {
        if let Outcome::Rejected(_) = outcome {
            self.approval
                .register_required_allowance_decrease(self.interface, order.to_asset, order.to_asset_allowance);
        }
    }
}

/// Admission condition for the pre-queue the orchestrator holds `EvalOrder`s
/// in before `add_orders`-ing them: capacity (`eval.size + submit.size <=
/// maxPendingTransactions`) is checked by the caller against the two queues
/// directly; this covers the per-order timing half of the gate (§4.F
/// "between stages").
pub fn underwrite_delay_elapsed(event_block_number: u64, underwrite_delay: u64, current_block: u64) -> bool {
    current_block >= event_block_number + underwrite_delay
}

impl serde::Serialize for UnderwriteOrder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("UnderwriteOrder", 6)?;
        s.serialize_field("toVault", &self.to_vault)?;
        s.serialize_field("toAsset", &self.to_asset)?;
        s.serialize_field("units", &self.units.to_string())?;
        s.serialize_field("minOut", &self.min_out.to_string())?;
        s.serialize_field("toAccount", &self.to_account)?;
        s.serialize_field("underwriteIncentiveX16", &self.underwrite_incentive_x16)?;
        s.end()
    }
}
