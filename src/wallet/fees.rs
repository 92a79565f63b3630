//! Fee computation, kept as free functions over `U256` so the arithmetic is
//! unit-testable without a live RPC (§4.D, §8 property 2).
//!
//! All multiplier fields are basis points with a shared base of 10000, per
//! §9's "decimal multipliers as (u64, u64) numerator/denominator pairs"
//! guidance (here: `bps / 10_000`). Every adjustment factor is capped at
//! 5x (50000 bps) by `config::RawChainConfig::resolve`, so this module does
//! not re-check the bound.

use ethers::types::U256;

const BPS_BASE: u64 = 10_000;

fn scale_by_bps(value: U256, bps: u64) -> U256 {
    value.saturating_mul(U256::from(bps)) / U256::from(BPS_BASE)
}

fn gwei(value: u64) -> U256 {
    U256::from(value) * U256::exp10(9)
}

#[derive(Debug, Clone, Copy)]
pub struct QueriedFeeData {
    pub base_fee: U256,
    pub max_priority_fee_per_gas: Option<U256>,
    pub gas_price: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasFields {
    Eip1559 { max_fee_per_gas: U256, max_priority_fee_per_gas: U256 },
    Legacy { gas_price: U256 },
}

#[derive(Debug, Clone, Copy)]
pub struct FeeConfig {
    pub max_priority_fee_adjustment_bps: u64,
    pub max_allowed_priority_fee_per_gas_gwei: u64,
    pub gas_price_adjustment_bps: u64,
    pub max_allowed_gas_price_gwei: u64,
    pub max_fee_per_gas_gwei: u64,
    pub priority_adjustment_factor_bps: u64,
}

/// Computes gas fields for a fresh submission. `priority` is true for a
/// replacement-by-fee bump (§4.D confirm queue), applying the extra
/// `priority_adjustment_factor_bps` multiplier on top of the base adjustment.
pub fn compute_fees(queried: QueriedFeeData, config: &FeeConfig, priority: bool) -> GasFields {
    match queried.max_priority_fee_per_gas {
        Some(queried_priority) => {
            let mut max_priority_fee_per_gas = scale_by_bps(queried_priority, config.max_priority_fee_adjustment_bps)
                .min(gwei(config.max_allowed_priority_fee_per_gas_gwei));

            let base_fee_headroom = queried.base_fee.saturating_mul(U256::from(2)) + max_priority_fee_per_gas;
            let mut max_fee_per_gas = gwei(config.max_fee_per_gas_gwei).min(base_fee_headroom);

            if priority {
                max_priority_fee_per_gas = scale_by_bps(max_priority_fee_per_gas, config.priority_adjustment_factor_bps);
                max_fee_per_gas = scale_by_bps(max_fee_per_gas, config.priority_adjustment_factor_bps);
            }

            GasFields::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }
        }
        None => {
            let mut gas_price =
                scale_by_bps(queried.gas_price, config.gas_price_adjustment_bps).min(gwei(config.max_allowed_gas_price_gwei));
            if priority {
                gas_price = scale_by_bps(gas_price, config.priority_adjustment_factor_bps);
            }
            GasFields::Legacy { gas_price }
        }
    }
}

/// Replacement bump for the confirm queue's timeout path: per-field max of
/// `(original * priority_factor)` and a freshly queried priority bundle,
/// per §4.D's `getIncreasedFeeDataForTransaction`.
pub fn increased_fees(original: GasFields, fresh_queried: QueriedFeeData, config: &FeeConfig) -> GasFields {
    let bumped_from_fresh = compute_fees(fresh_queried, config, true);
    match (original, bumped_from_fresh) {
        (
            GasFields::Eip1559 { max_fee_per_gas: of, max_priority_fee_per_gas: op },
            GasFields::Eip1559 { max_fee_per_gas: nf, max_priority_fee_per_gas: np },
        ) => {
            let bumped_original_fee = scale_by_bps(of, config.priority_adjustment_factor_bps);
            let bumped_original_priority = scale_by_bps(op, config.priority_adjustment_factor_bps);
            GasFields::Eip1559 {
                max_fee_per_gas: bumped_original_fee.max(nf),
                max_priority_fee_per_gas: bumped_original_priority.max(np),
            }
        }
        (GasFields::Legacy { gas_price: og }, GasFields::Legacy { gas_price: ng }) => {
            let bumped_original = scale_by_bps(og, config.priority_adjustment_factor_bps);
            GasFields::Legacy { gas_price: bumped_original.max(ng) }
        }
        // Fee-market mode flipped between submissions; prefer the fresh read.
        (_, fresh) => fresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FeeConfig {
        FeeConfig {
            max_priority_fee_adjustment_bps: 12_000,
            max_allowed_priority_fee_per_gas_gwei: 10,
            gas_price_adjustment_bps: 12_000,
            max_allowed_gas_price_gwei: 500,
            max_fee_per_gas_gwei: 300,
            priority_adjustment_factor_bps: 14_000,
        }
    }

    #[test]
    fn eip1559_respects_priority_cap() {
        let queried = QueriedFeeData {
            base_fee: gwei(20),
            max_priority_fee_per_gas: Some(gwei(50)), // way above the cap
            gas_price: gwei(20),
        };
        let fees = compute_fees(queried, &config(), false);
        match fees {
            GasFields::Eip1559 { max_priority_fee_per_gas, .. } => {
                assert_eq!(max_priority_fee_per_gas, gwei(10));
            }
            _ => panic!("expected eip1559 fields"),
        }
    }

    #[test]
    fn eip1559_max_fee_bounded_by_base_fee_headroom() {
        let queried = QueriedFeeData {
            base_fee: gwei(1),
            max_priority_fee_per_gas: Some(gwei(1)),
            gas_price: gwei(1),
        };
        let fees = compute_fees(queried, &config(), false);
        match fees {
            GasFields::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => {
                // base_fee*2 + priority = 2gwei + ~1.2gwei, well under the 300 gwei cap
                assert!(max_fee_per_gas < gwei(300));
                assert!(max_fee_per_gas >= max_priority_fee_per_gas);
            }
            _ => panic!("expected eip1559 fields"),
        }
    }

    #[test]
    fn legacy_branch_used_when_no_priority_fee() {
        let queried = QueriedFeeData {
            base_fee: U256::zero(),
            max_priority_fee_per_gas: None,
            gas_price: gwei(20),
        };
        let fees = compute_fees(queried, &config(), false);
        assert!(matches!(fees, GasFields::Legacy { .. }));
    }

    #[test]
    fn replacement_takes_max_of_bumped_original_and_fresh() {
        let original = GasFields::Eip1559 {
            max_fee_per_gas: gwei(5),
            max_priority_fee_per_gas: gwei(1),
        };
        let fresh = QueriedFeeData {
            base_fee: gwei(1),
            max_priority_fee_per_gas: Some(gwei(1)),
            gas_price: gwei(1),
        };
        let bumped = increased_fees(original, fresh, &config());
        match bumped {
            GasFields::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => {
                // bumped original (5 * 1.4 = 7 gwei) dominates the fresh read
                assert_eq!(max_fee_per_gas, gwei(7));
                assert!(max_priority_fee_per_gas >= gwei(1));
            }
            _ => panic!("expected eip1559 fields"),
        }
    }
}
