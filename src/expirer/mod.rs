//! Expirer pipeline (§4.G): symmetric to the Underwriter but single-purpose
//! — reclaim collateral (own underwrites) or free protocol state (others')
//! once a swap's underwrite window has passed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use tracing::warn;

use crate::abi::CATALYST_CHAIN_INTERFACE_ABI;
use crate::config::ResolvedChainConfig;
use crate::error::{Subsystem, UnderwriterError};
use crate::queue::{HandleOutcome, OrderHandler, QueueOrder};
use crate::store::Store;
use crate::types::{UnderwriteKey, UnderwriteStatus};
use crate::wallet::{WalletHandle, WalletOptions, WalletOutcome, WalletTransactionRequest};

#[derive(Debug, Clone)]
pub struct ExpireOrder {
    pub key: UnderwriteKey,
    pub to_vault: Address,
    pub to_asset: Address,
    pub units: U256,
    pub min_out: U256,
    pub to_account: Address,
    pub underwrite_incentive_x16: u16,
    pub calldata: Bytes,
}

impl QueueOrder for ExpireOrder {
    fn id(&self) -> String {
        self.key.store_key()
    }
}

struct HeapEntry {
    expire_at: u64,
    key: UnderwriteKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expire_at == other.expire_at
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expire_at.cmp(&other.expire_at)
    }
}

/// Admission structure: a min-heap of `(expireAt, key)` plus a membership
/// index so `onSwapUnderwriteComplete`/`onExpireUnderwrite` can remove the
/// matching entry in O(log n) amortized (lazy deletion via the index).
pub struct ExpiryAdmission {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    live: HashMap<UnderwriteKey, u64>,
}

impl Default for ExpiryAdmission {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryAdmission {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), live: HashMap::new() }
    }

    /// Computes `expireAt` per §4.G and inserts.
    pub fn admit(&mut self, key: UnderwriteKey, expiry_block: u64, underwriter: Option<Address>, own_address: Address, expire_blocks_margin: u64) {
        let expire_at = if underwriter == Some(own_address) {
            expiry_block.saturating_sub(expire_blocks_margin)
        } else {
            expiry_block
        };
        self.live.insert(key.clone(), expire_at);
        self.heap.push(Reverse(HeapEntry { expire_at, key }));
    }

    pub fn remove(&mut self, key: &UnderwriteKey) {
        if self.live.remove(key).is_none() {
            warn!(underwrite_id = %key.underwrite_id, "expirer: remove for unknown admission entry");
        }
    }

    /// Pops every entry whose `expireAt <= current_block` and is still live
    /// (not removed via completion/expiry events), draining stale heap
    /// entries left behind by `remove`.
    pub fn drain_ready(&mut self, current_block: u64) -> Vec<UnderwriteKey> {
        let mut ready = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.expire_at > current_block {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            match self.live.get(&entry.key) {
                Some(&recorded) if recorded == entry.expire_at => {
                    self.live.remove(&entry.key);
                    ready.push(entry.key);
                }
                _ => {} // stale or superseded entry, drop silently
            }
        }
        ready
    }
}

pub struct EvalHandler {
    store: Arc<Store>,
    config: ResolvedChainConfig,
}

impl EvalHandler {
    pub fn new(store: Arc<Store>, config: ResolvedChainConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl OrderHandler<crate::underwriter::EvalOrder> for EvalHandler {
    type Result = ExpireOrder;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Eval
    }

    async fn handle_order(
        &self,
        order: &crate::underwriter::EvalOrder,
        _retry_count: u32,
    ) -> Result<HandleOutcome<Self::Result>, UnderwriterError> {
        let state = self
            .store
            .get_active_underwrite_state(&order.key)
            .map_err(|e| UnderwriterError::Upstream { subsystem: Subsystem::Eval, reason: e.to_string() })?;

        let Some(state) = state else {
            return Ok(HandleOutcome::Dropped);
        };

        // "already expired": a listener-driven transition away from
        // Underwritten means someone else's expireUnderwrite (or a
        // fulfillment) landed first.
        if state.status != UnderwriteStatus::Underwritten {
            return Ok(HandleOutcome::Dropped);
        }

        // minUnderwriteDuration is enforced in block-count terms via
        // expireBlocksMargin at admission rather than re-derived here from a
        // wall clock — see DESIGN.md. `min_underwrite_duration_ms` stays on
        // this handler only for that cross-reference in logs.
        tracing::trace!(
            underwrite_id = %state.key.underwrite_id,
            min_underwrite_duration_ms = self.config.min_underwrite_duration_ms,
            "expirer eval: duration floor enforced via admission margin"
        );

        Ok(HandleOutcome::Settled(ExpireOrder {
            key: state.key.clone(),
            to_vault: state.to_vault,
            to_asset: state.to_asset,
            units: state.units,
            min_out: state.min_out,
            to_account: state.to_account,
            underwrite_incentive_x16: state.underwrite_incentive_x16 as u16,
            calldata: state.calldata.clone(),
        }))
    }
}

pub struct SubmitHandler {
    interface: Address,
    wallet: WalletHandle,
}

impl SubmitHandler {
    pub fn new(interface: Address, wallet: WalletHandle) -> Self {
        Self { interface, wallet }
    }
}

#[async_trait]
impl OrderHandler<ExpireOrder> for SubmitHandler {
    type Result = ();

    fn subsystem(&self) -> Subsystem {
        Subsystem::Wallet
    }

    async fn handle_order(
        &self,
        order: &ExpireOrder,
        _retry_count: u32,
    ) -> Result<HandleOutcome<Self::Result>, UnderwriterError> {
        let function = CATALYST_CHAIN_INTERFACE_ABI
            .function("expireUnderwrite")
            .expect("expireUnderwrite selector is part of the embedded ABI");
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
                reason: format!("failed to encode expireUnderwrite calldata: {e}"),
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
                metadata: serde_json::json!({"underwriteId": order.key.underwrite_id.to_string()}),
                options: WalletOptions {
                    retry_on_nonce_confirmation_error: false,
                },
            })
            .await
            .map_err(|e| UnderwriterError::Submission {
                subsystem: Subsystem::Wallet,
                reason: e.to_string(),
                unrecoverable: false,
            })?;

        match reply.outcome {
            WalletOutcome::Confirmed(_) => Ok(HandleOutcome::Settled(())),
            WalletOutcome::SubmissionError(e) | WalletOutcome::ConfirmationError(e) => Err(e),
        }
    }

    /// Not retried on submission error, to avoid repeatedly bumping fees on
    /// a losing race with another expirer (§4.G).
    async fn handle_failed_order(&self, _order: &ExpireOrder, _retry_count: u32, _error: &UnderwriterError) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;
    use crate::types::UnderwriteId;

    fn key(id: u8) -> UnderwriteKey {
        UnderwriteKey {
            to_chain_id: 1,
            to_interface: Address::zero(),
            underwrite_id: UnderwriteId(H256::from_low_u64_be(id as u64)),
        }
    }

    #[test]
    fn admits_own_underwrite_with_margin() {
        let mut admission = ExpiryAdmission::new();
        let own = Address::from_low_u64_be(1);
        admission.admit(key(1), 1000, Some(own), own, 100);
        assert!(admission.drain_ready(899).is_empty());
        let ready = admission.drain_ready(900);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn admits_third_party_underwrite_without_margin() {
        let mut admission = ExpiryAdmission::new();
        let own = Address::from_low_u64_be(1);
        let other = Address::from_low_u64_be(2);
        admission.admit(key(2), 1000, Some(other), own, 100);
        assert!(admission.drain_ready(999).is_empty());
        assert_eq!(admission.drain_ready(1000).len(), 1);
    }

    #[test]
    fn remove_drops_entry_before_it_fires() {
        let mut admission = ExpiryAdmission::new();
        let own = Address::from_low_u64_be(1);
        admission.admit(key(3), 500, Some(own), own, 0);
        admission.remove(&key(3));
        assert!(admission.drain_ready(500).is_empty());
    }
}
