//! Core data model shared across Store, the pipelines and the wallet.
//!
//! `SwapIdentifier`/`UnderwriteKey` are the two fingerprints orders are keyed
//! by; `ActiveSwapState` is the mutable record the Store persists per swap.

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// `keccak256(abi(toAccount, units, fromAmount - fee, fromAsset, blockNumber))`,
/// per §3. Used only for correlation/logging, never as a Store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapIdentifier(pub H256);

impl SwapIdentifier {
    pub fn compute(to_account: Address, units: U256, amount_after_fee: U256, from_asset: Address, block_number: u64) -> Self {
        let mut buf = Vec::with_capacity(20 + 32 + 32 + 20 + 8);
        buf.extend_from_slice(to_account.as_bytes());
        let mut units_be = [0u8; 32];
        units.to_big_endian(&mut units_be);
        buf.extend_from_slice(&units_be);
        let mut amount_be = [0u8; 32];
        amount_after_fee.to_big_endian(&mut amount_be);
        buf.extend_from_slice(&amount_be);
        buf.extend_from_slice(from_asset.as_bytes());
        buf.extend_from_slice(&block_number.to_be_bytes());
        Self(H256::from(keccak256(&buf)))
    }
}

impl std::fmt::Display for SwapIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque destination-contract-derived identifier. Treated as 32 bytes, never
/// interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnderwriteId(pub H256);

impl std::fmt::Display for UnderwriteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The Store key a swap's active state lives under: `(toChainId, toInterface,
/// underwriteId)` lowercased, per §3 and §6.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnderwriteKey {
    pub to_chain_id: u64,
    pub to_interface: Address,
    pub underwrite_id: UnderwriteId,
}

impl UnderwriteKey {
    pub fn store_key(&self) -> String {
        format!(
            "underwrite:{}:{:#x}:{:#x}",
            self.to_chain_id, self.to_interface, self.underwrite_id.0
        )
        .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnderwriteStatus {
    Pending,
    Underwritten,
    Fulfilled,
    Expired,
}

/// The full swap record as carried end-to-end (§3's immutable + derived +
/// mutable fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSwapState {
    pub key: UnderwriteKey,
    pub from_chain_id: u64,
    pub from_vault: Address,
    pub channel_id: H256,
    pub to_vault: Address,
    pub to_account: Address,
    pub from_asset: Address,
    pub to_asset: Address,
    pub from_amount: U256,
    pub min_out: U256,
    pub units: U256,
    pub fee: U256,
    pub underwrite_incentive_x16: u32,
    pub calldata: Bytes,
    pub event_block_number: u64,
    pub event_block_timestamp_ms: u64,
    pub expiry_block: u64,
    pub status: UnderwriteStatus,
    pub last_transition_block: u64,
    pub underwriter: Option<Address>,
}

impl ActiveSwapState {
    pub fn fingerprint(&self) -> SwapIdentifier {
        SwapIdentifier::compute(
            self.to_account,
            self.units,
            self.from_amount.saturating_sub(self.fee),
            self.from_asset,
            self.event_block_number,
        )
    }
}
