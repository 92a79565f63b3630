//! Approval Handler: owns the allowance ledger and batches ERC-20 approvals
//! through the wallet (§4.E). Single-writer per chain — the struct lives
//! behind one `Arc` held by the one task that owns it; callers reach it
//! through an mpsc port rather than sharing `&mut` access, so the
//! single-writer invariant is enforced by ownership, not convention.

use dashmap::DashMap;
use ethers::types::{Address, U256};
use tracing::{error, warn};

use crate::abi::ERC20_ABI;
use crate::wallet::{WalletHandle, WalletOptions, WalletOutcome, WalletTransactionRequest};

type AllowanceKey = (Address, Address); // (interface, asset)

pub struct ApprovalHandler {
    required: DashMap<AllowanceKey, U256>,
    set: DashMap<AllowanceKey, U256>,
    wallet: WalletHandle,
}

pub struct AllowanceIncrease {
    pub interface: Address,
    pub asset: Address,
    pub amount: U256,
}

impl ApprovalHandler {
    pub fn new(wallet: WalletHandle) -> Self {
        Self {
            required: DashMap::new(),
            set: DashMap::new(),
            wallet,
        }
    }

    /// `required[iface][asset] += amount` for each order, then reconciles
    /// on-chain allowances immediately.
    pub async fn update_allowances(&self, increases: &[AllowanceIncrease]) {
        for inc in increases {
            self.required
                .entry((inc.interface, inc.asset))
                .and_modify(|v| *v += inc.amount)
                .or_insert(inc.amount);
        }
        self.set_allowances().await;
    }

    /// Cancelled-before-submission path: undoes a previously registered
    /// increase without touching `set`.
    pub fn register_required_allowance_decrease(&self, interface: Address, asset: Address, amount: U256) {
        if let Some(mut entry) = self.required.get_mut(&(interface, asset)) {
            *entry = entry.saturating_sub(amount);
        }
    }

    /// Called after a successful underwrite: decreases both maps by the
    /// amount actually used, so the next reconciliation does not re-approve
    /// for an allowance that has already been consumed on-chain.
    pub fn register_allowance_use(&self, interface: Address, asset: Address, amount: U256) {
        if let Some(mut entry) = self.required.get_mut(&(interface, asset)) {
            *entry = entry.saturating_sub(amount);
        }
        if let Some(mut entry) = self.set.get_mut(&(interface, asset)) {
            *entry = entry.saturating_sub(amount);
        }
    }

    pub fn required_allowance(&self, interface: Address, asset: Address) -> U256 {
        self.required.get(&(interface, asset)).map(|v| *v).unwrap_or_default()
    }

    /// For every `(iface, asset)` where `required != set`: optimistically
    /// set `set := required` before dispatching the approve, and roll back
    /// on failure. `retryOnNonceConfirmationError=false` since approval
    /// ordering across assets does not need to survive a nonce race.
    async fn set_allowances(&self) {
        let stale: Vec<(AllowanceKey, U256, U256)> = self
            .required
            .iter()
            .filter_map(|entry| {
                let key = *entry.key();
                let required = *entry.value();
                let set = self.set.get(&key).map(|v| *v).unwrap_or_default();
                (required != set).then_some((key, required, set))
            })
            .collect();

        for ((interface, asset), required, previous_set) in stale {
            self.set.insert((interface, asset), required);

            let call = ERC20_ABI
                .function("approve")
                .expect("approve selector is part of the embedded ABI");
            let Ok(calldata) = call.encode_input(&[
                ethers::abi::Token::Address(interface),
                ethers::abi::Token::Uint(required),
            ]) else {
                error!("failed to encode approve calldata");
                self.set.insert((interface, asset), previous_set);
                continue;
            };

            let tx_request = ethers::types::transaction::eip2718::TypedTransaction::Eip1559(
                ethers::types::transaction::eip1559::Eip1559TransactionRequest::new()
                    .to(asset)
                    .data(calldata),
            );

            let reply = self
                .wallet
                .submit(WalletTransactionRequest {
                    tx_request,
                    metadata: serde_json::json!({"kind": "approve", "interface": interface, "asset": asset}),
                    options: WalletOptions {
                        retry_on_nonce_confirmation_error: false,
                    },
                })
                .await;

            match reply {
                Ok(r) => match r.outcome {
                    WalletOutcome::Confirmed(_) => {}
                    WalletOutcome::SubmissionError(e) | WalletOutcome::ConfirmationError(e) => {
                        warn!(interface = %interface, asset = %asset, error = %e, "approve failed, rolling back set allowance");
                        self.set.insert((interface, asset), previous_set);
                    }
                },
                Err(e) => {
                    warn!(interface = %interface, asset = %asset, error = %e, "wallet port error on approve, rolling back");
                    self.set.insert((interface, asset), previous_set);
                }
            }
        }
    }
}
