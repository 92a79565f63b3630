//! Pricing oracle seam (§4.F.1). The reference implementation leaves the
//! expected-out valuation unspecified; this pins it to a 1:1 `units` model
//! behind a trait so a real price feed can be substituted without touching
//! the eval handler.

use async_trait::async_trait;
use ethers::types::U256;

use crate::types::ActiveSwapState;

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Expected amount of `toAsset` the swap is owed, in the asset's base
    /// units. Used only to size `underwriteReward`/`toAssetAllowance`.
    async fn expected_out(&self, state: &ActiveSwapState) -> U256;
}

/// `units` is already a cross-chain-normalized amount in Catalyst's AMM
/// interface; this oracle treats it as the expected payout directly, with no
/// external price feed (documented scope limitation, see DESIGN.md).
pub struct UnitsAsExpectedOutOracle;

#[async_trait]
impl PriceOracle for UnitsAsExpectedOutOracle {
    async fn expected_out(&self, state: &ActiveSwapState) -> U256 {
        state.units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, H256};
    use crate::types::{UnderwriteId, UnderwriteKey, UnderwriteStatus};

    fn state(units: U256) -> ActiveSwapState {
        ActiveSwapState {
            key: UnderwriteKey {
                to_chain_id: 1,
                to_interface: Address::zero(),
                underwrite_id: UnderwriteId(H256::zero()),
            },
            from_chain_id: 2,
            from_vault: Address::zero(),
            channel_id: H256::zero(),
            to_vault: Address::zero(),
            to_account: Address::zero(),
            from_asset: Address::zero(),
            to_asset: Address::zero(),
            from_amount: units,
            min_out: U256::zero(),
            units,
            fee: U256::zero(),
            underwrite_incentive_x16: 65,
            calldata: Bytes::default(),
            event_block_number: 1,
            event_block_timestamp_ms: 0,
            expiry_block: 100,
            status: UnderwriteStatus::Pending,
            last_transition_block: 1,
            underwriter: None,
        }
    }

    #[tokio::test]
    async fn treats_units_as_expected_out() {
        let oracle = UnitsAsExpectedOutOracle;
        let out = oracle.expected_out(&state(U256::from(1_000))).await;
        assert_eq!(out, U256::from(1_000));
    }
}
