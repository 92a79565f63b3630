//! Layered YAML configuration: `config.<env>.yaml` loaded via the `config`
//! crate, schema-validated, then resolved field-by-field into one
//! `ResolvedChainConfig` per chain (§6, §9's "dynamic config with nullable
//! fields" guidance).

pub mod schema;

use std::collections::HashMap;
use std::str::FromStr;

use ethers::types::{Address, H256, U256};
use serde::Deserialize;

use crate::config::schema::{is_hex_address, is_hex_bytes32};

/// Raw document, one-to-one with the YAML shape. Every chain-level numeric
/// knob is optional here and falls back to `global`, then to a hardcoded
/// default, in `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub global: RawGlobalConfig,
    #[serde(default)]
    pub ambs: Vec<RawAmbConfig>,
    pub chains: Vec<RawChainConfig>,
    #[serde(default)]
    pub endpoints: Vec<RawEndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGlobalConfig {
    pub port: u16,
    pub private_key: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    pub relayer_host: Option<String>,
    pub relayer_port: Option<u16>,

    pub block_delay: Option<u64>,
    pub monitor_interval_ms: Option<u64>,
    pub underwrite_delay: Option<u64>,
    pub max_underwrite_allowed: Option<String>,
    pub min_underwrite_reward: Option<String>,
    pub relative_min_underwrite_reward: Option<f64>,
    pub underwrite_blocks_margin: Option<u64>,
    pub underwrite_expiry_blocks: Option<u64>,
    pub max_submission_delay_ms: Option<u64>,
    pub allowance_buffer_bps: Option<u64>,
    pub expire_blocks_margin: Option<u64>,
    pub min_underwrite_duration_ms: Option<u64>,
    pub max_pending_transactions: Option<usize>,
    pub confirmations: Option<u64>,
    pub confirmation_timeout_ms: Option<u64>,
    pub max_tries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub max_priority_fee_adjustment_bps: Option<u64>,
    pub max_allowed_priority_fee_per_gas_gwei: Option<u64>,
    pub gas_price_adjustment_bps: Option<u64>,
    pub max_allowed_gas_price_gwei: Option<u64>,
    pub max_fee_per_gas_gwei: Option<u64>,
    pub priority_adjustment_factor_bps: Option<u64>,
    pub gas_balance_update_interval_ms: Option<u64>,
    pub low_gas_balance_warning_wei: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAmbConfig {
    pub name: String,
    #[serde(default)]
    pub channels: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChainConfig {
    #[serde(rename = "chainId")]
    pub chain_id: u64,
    pub rpc: String,
    pub is_l1: Option<bool>,

    pub block_delay: Option<u64>,
    pub monitor_interval_ms: Option<u64>,
    pub underwrite_delay: Option<u64>,
    pub max_underwrite_allowed: Option<String>,
    pub min_underwrite_reward: Option<String>,
    pub relative_min_underwrite_reward: Option<f64>,
    pub underwrite_blocks_margin: Option<u64>,
    pub underwrite_expiry_blocks: Option<u64>,
    pub max_submission_delay_ms: Option<u64>,
    pub allowance_buffer_bps: Option<u64>,
    pub expire_blocks_margin: Option<u64>,
    pub min_underwrite_duration_ms: Option<u64>,
    pub max_pending_transactions: Option<usize>,
    pub confirmations: Option<u64>,
    pub confirmation_timeout_ms: Option<u64>,
    pub max_tries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub max_priority_fee_adjustment_bps: Option<u64>,
    pub max_allowed_priority_fee_per_gas_gwei: Option<u64>,
    pub gas_price_adjustment_bps: Option<u64>,
    pub max_allowed_gas_price_gwei: Option<u64>,
    pub max_fee_per_gas_gwei: Option<u64>,
    pub priority_adjustment_factor_bps: Option<u64>,
    pub gas_balance_update_interval_ms: Option<u64>,
    pub low_gas_balance_warning_wei: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpointConfig {
    #[serde(rename = "chainId")]
    pub chain_id: u64,
    pub amb: String,
    pub factory: String,
    pub interface: String,
    pub incentives: Option<String>,
    pub vaults: Vec<String>,
}

/// Effective, fully-resolved per-chain configuration, built once at worker
/// spawn time by `global.or(chain).unwrap_or(default)` layering. Never holds
/// an `Option` for a tuning knob — only for things that are genuinely absent
/// (e.g. no relayer configured).
#[derive(Debug, Clone)]
pub struct ResolvedChainConfig {
    pub chain_id: u64,
    pub rpc: String,
    pub is_l1: bool,

    pub block_delay: u64,
    pub monitor_interval_ms: u64,
    pub underwrite_delay: u64,
    pub max_underwrite_allowed: U256,
    pub min_underwrite_reward: U256,
    pub relative_min_underwrite_reward: f64,
    pub underwrite_blocks_margin: u64,
    pub underwrite_expiry_blocks: u64,
    pub max_submission_delay_ms: u64,
    pub allowance_buffer_bps: u64,
    pub expire_blocks_margin: u64,
    pub min_underwrite_duration_ms: u64,
    pub max_pending_transactions: usize,
    pub confirmations: u64,
    pub confirmation_timeout_ms: u64,
    pub max_tries: u32,
    pub retry_interval_ms: u64,
    pub max_concurrent: usize,
    pub max_priority_fee_adjustment_bps: u64,
    pub max_allowed_priority_fee_per_gas_gwei: u64,
    pub gas_price_adjustment_bps: u64,
    pub max_allowed_gas_price_gwei: u64,
    pub max_fee_per_gas_gwei: u64,
    pub priority_adjustment_factor_bps: u64,
    pub gas_balance_update_interval_ms: u64,
    pub low_gas_balance_warning_wei: U256,
}

/// Defaults applied when neither `chains[].<field>` nor `global.<field>` is
/// set. `min_underwrite_duration_ms` floors at 30 minutes per §4.G, default 2h.
mod defaults {
    pub const BLOCK_DELAY: u64 = 2;
    pub const MONITOR_INTERVAL_MS: u64 = 5_000;
    pub const UNDERWRITE_DELAY: u64 = 0;
    pub const RELATIVE_MIN_UNDERWRITE_REWARD: f64 = 0.0;
    pub const UNDERWRITE_BLOCKS_MARGIN: u64 = 10;
    // Assumed vault underwriting window when projecting a not-yet-underwritten
    // swap's expiry at eval time, expressed in blocks rather than
    // `MIN_UNDERWRITE_DURATION_MS`'s wall-clock terms since eval's margin
    // check is block-based (§4.F step 5).
    pub const UNDERWRITE_EXPIRY_BLOCKS: u64 = 600;
    pub const MAX_SUBMISSION_DELAY_MS: u64 = 60_000;
    pub const ALLOWANCE_BUFFER_BPS: u64 = 500; // 5%
    pub const EXPIRE_BLOCKS_MARGIN: u64 = 100;
    pub const MIN_UNDERWRITE_DURATION_MS: u64 = 2 * 60 * 60 * 1000;
    pub const MIN_UNDERWRITE_DURATION_FLOOR_MS: u64 = 30 * 60 * 1000;
    pub const MAX_PENDING_TRANSACTIONS: usize = 20;
    pub const CONFIRMATIONS: u64 = 1;
    pub const CONFIRMATION_TIMEOUT_MS: u64 = 90_000;
    pub const MAX_TRIES: u32 = 3;
    pub const RETRY_INTERVAL_MS: u64 = 5_000;
    pub const MAX_CONCURRENT: usize = 10;
    pub const MAX_PRIORITY_FEE_ADJUSTMENT_BPS: u64 = 12_000; // x1.2
    pub const MAX_ALLOWED_PRIORITY_FEE_PER_GAS_GWEI: u64 = 10;
    pub const GAS_PRICE_ADJUSTMENT_BPS: u64 = 12_000;
    pub const MAX_ALLOWED_GAS_PRICE_GWEI: u64 = 500;
    pub const MAX_FEE_PER_GAS_GWEI: u64 = 300;
    pub const PRIORITY_ADJUSTMENT_FACTOR_BPS: u64 = 14_000; // x1.4, replacement bump
    pub const GAS_BALANCE_UPDATE_INTERVAL_MS: u64 = 60_000;
    pub const LOW_GAS_BALANCE_WARNING_WEI: &str = "100000000000000000"; // 0.1 native
}

macro_rules! resolve_field {
    ($chain:expr, $global:expr, $field:ident, $default:expr) => {
        $chain.$field.or($global.$field).unwrap_or($default)
    };
}

impl RawChainConfig {
    pub fn resolve(&self, global: &RawGlobalConfig) -> eyre::Result<ResolvedChainConfig> {
        let parse_u256 = |s: &Option<String>, default: &str| -> eyre::Result<U256> {
            U256::from_dec_str(s.as_deref().unwrap_or(default)).map_err(|e| eyre::eyre!(e))
        };

        Ok(ResolvedChainConfig {
            chain_id: self.chain_id,
            rpc: self.rpc.clone(),
            is_l1: self.is_l1.unwrap_or(true),

            block_delay: resolve_field!(self, global, block_delay, defaults::BLOCK_DELAY),
            monitor_interval_ms: resolve_field!(self, global, monitor_interval_ms, defaults::MONITOR_INTERVAL_MS),
            underwrite_delay: resolve_field!(self, global, underwrite_delay, defaults::UNDERWRITE_DELAY),
            max_underwrite_allowed: parse_u256(
                &self.max_underwrite_allowed.clone().or_else(|| global.max_underwrite_allowed.clone()),
                &U256::MAX.to_string(),
            )?,
            min_underwrite_reward: parse_u256(
                &self.min_underwrite_reward.clone().or_else(|| global.min_underwrite_reward.clone()),
                "0",
            )?,
            relative_min_underwrite_reward: resolve_field!(
                self,
                global,
                relative_min_underwrite_reward,
                defaults::RELATIVE_MIN_UNDERWRITE_REWARD
            ),
            underwrite_blocks_margin: resolve_field!(self, global, underwrite_blocks_margin, defaults::UNDERWRITE_BLOCKS_MARGIN),
            underwrite_expiry_blocks: resolve_field!(self, global, underwrite_expiry_blocks, defaults::UNDERWRITE_EXPIRY_BLOCKS),
            max_submission_delay_ms: resolve_field!(self, global, max_submission_delay_ms, defaults::MAX_SUBMISSION_DELAY_MS),
            allowance_buffer_bps: resolve_field!(self, global, allowance_buffer_bps, defaults::ALLOWANCE_BUFFER_BPS),
            expire_blocks_margin: resolve_field!(self, global, expire_blocks_margin, defaults::EXPIRE_BLOCKS_MARGIN),
            min_underwrite_duration_ms: resolve_field!(self, global, min_underwrite_duration_ms, defaults::MIN_UNDERWRITE_DURATION_MS)
                .max(defaults::MIN_UNDERWRITE_DURATION_FLOOR_MS),
            max_pending_transactions: resolve_field!(self, global, max_pending_transactions, defaults::MAX_PENDING_TRANSACTIONS),
            confirmations: resolve_field!(self, global, confirmations, defaults::CONFIRMATIONS),
            confirmation_timeout_ms: resolve_field!(self, global, confirmation_timeout_ms, defaults::CONFIRMATION_TIMEOUT_MS),
            max_tries: resolve_field!(self, global, max_tries, defaults::MAX_TRIES),
            retry_interval_ms: resolve_field!(self, global, retry_interval_ms, defaults::RETRY_INTERVAL_MS),
            max_concurrent: resolve_field!(self, global, max_concurrent, defaults::MAX_CONCURRENT),
            max_priority_fee_adjustment_bps: resolve_field!(
                self,
                global,
                max_priority_fee_adjustment_bps,
                defaults::MAX_PRIORITY_FEE_ADJUSTMENT_BPS
            )
            .min(50_000), // hard upper bound, factor <= 5x per §4.D
            max_allowed_priority_fee_per_gas_gwei: resolve_field!(
                self,
                global,
                max_allowed_priority_fee_per_gas_gwei,
                defaults::MAX_ALLOWED_PRIORITY_FEE_PER_GAS_GWEI
            ),
            gas_price_adjustment_bps: resolve_field!(self, global, gas_price_adjustment_bps, defaults::GAS_PRICE_ADJUSTMENT_BPS)
                .min(50_000),
            max_allowed_gas_price_gwei: resolve_field!(self, global, max_allowed_gas_price_gwei, defaults::MAX_ALLOWED_GAS_PRICE_GWEI),
            max_fee_per_gas_gwei: resolve_field!(self, global, max_fee_per_gas_gwei, defaults::MAX_FEE_PER_GAS_GWEI),
            priority_adjustment_factor_bps: resolve_field!(
                self,
                global,
                priority_adjustment_factor_bps,
                defaults::PRIORITY_ADJUSTMENT_FACTOR_BPS
            )
            .min(50_000),
            gas_balance_update_interval_ms: resolve_field!(
                self,
                global,
                gas_balance_update_interval_ms,
                defaults::GAS_BALANCE_UPDATE_INTERVAL_MS
            ),
            low_gas_balance_warning_wei: parse_u256(
                &self.low_gas_balance_warning_wei.clone().or_else(|| global.low_gas_balance_warning_wei.clone()),
                defaults::LOW_GAS_BALANCE_WARNING_WEI,
            )?,
        })
    }
}

/// Parsed endpoint set for one (chain, amb) pair.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub chain_id: u64,
    pub amb: String,
    pub factory: Address,
    pub interface: Address,
    pub incentives: Option<Address>,
    pub vaults: Vec<Address>,
}

impl RawEndpointConfig {
    pub fn resolve(&self) -> eyre::Result<ResolvedEndpoint> {
        for addr in std::iter::once(&self.factory)
            .chain(std::iter::once(&self.interface))
            .chain(self.vaults.iter())
        {
            if !is_hex_address(addr) {
                return Err(eyre::eyre!("invalid address in endpoint config: {addr}"));
            }
        }
        Ok(ResolvedEndpoint {
            chain_id: self.chain_id,
            amb: self.amb.clone(),
            factory: Address::from_str(&self.factory)?,
            interface: Address::from_str(&self.interface)?,
            incentives: self.incentives.as_deref().map(Address::from_str).transpose()?,
            vaults: self.vaults.iter().map(|v| Address::from_str(v)).collect::<Result<_, _>>()?,
        })
    }
}

/// Top-level resolved config: one entry per chain plus the global HTTP/key
/// settings, ready to hand to the Orchestrator.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub port: u16,
    pub private_key: H256,
    pub relayer_host: Option<String>,
    pub relayer_port: Option<u16>,
    pub chains: Vec<ResolvedChainConfig>,
    pub endpoints: Vec<ResolvedEndpoint>,
}

/// Loads `config.<env>.yaml` via the `config` crate (layered with
/// environment overrides), validates it against the embedded schema, then
/// resolves every chain. `NODE_ENV` selects the file; `PRIVATE_KEY` is the
/// documented env fallback for `global.private_key`.
pub fn load() -> eyre::Result<ResolvedConfig> {
    let env = std::env::var("NODE_ENV").unwrap_or_else(|_| "production".to_string());
    let file_name = format!("config.{env}.yaml");

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&file_name).required(false))
        .add_source(config::Environment::with_prefix("UNDERWRITER").separator("__"))
        .build()?;

    let document: serde_json::Value = settings.clone().try_deserialize()?;
    schema::validate(&document).map_err(|e| eyre::eyre!("config schema validation failed: {e}"))?;

    let raw: RawConfig = settings.try_deserialize()?;
    resolve(raw)
}

fn resolve(raw: RawConfig) -> eyre::Result<ResolvedConfig> {
    let private_key_hex = raw
        .global
        .private_key
        .clone()
        .or_else(|| std::env::var("PRIVATE_KEY").ok())
        .ok_or_else(|| eyre::eyre!("no private key in config and PRIVATE_KEY is unset"))?;
    if !is_hex_bytes32(&private_key_hex) {
        return Err(eyre::eyre!("private key is not a 32-byte hex string"));
    }
    let private_key = H256::from_str(&private_key_hex)?;

    let port = std::env::var("UNDERWRITER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(raw.global.port);

    let relayer_host = std::env::var("RELAYER_HOST").ok().or_else(|| raw.global.relayer_host.clone());
    let relayer_port = std::env::var("RELAYER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .or(raw.global.relayer_port);

    let chains = raw
        .chains
        .iter()
        .map(|c| c.resolve(&raw.global))
        .collect::<eyre::Result<Vec<_>>>()?;
    let endpoints = raw.endpoints.iter().map(|e| e.resolve()).collect::<eyre::Result<Vec<_>>>()?;

    Ok(ResolvedConfig {
        port,
        private_key,
        relayer_host,
        relayer_port,
        chains,
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_with(private_key: &str) -> RawGlobalConfig {
        RawGlobalConfig {
            port: 8080,
            private_key: Some(private_key.to_string()),
            log_level: None,
            relayer_host: None,
            relayer_port: None,
            block_delay: Some(5),
            monitor_interval_ms: None,
            underwrite_delay: None,
            max_underwrite_allowed: None,
            min_underwrite_reward: None,
            relative_min_underwrite_reward: None,
            underwrite_blocks_margin: None,
            underwrite_expiry_blocks: None,
            max_submission_delay_ms: None,
            allowance_buffer_bps: None,
            expire_blocks_margin: None,
            min_underwrite_duration_ms: None,
            max_pending_transactions: None,
            confirmations: None,
            confirmation_timeout_ms: None,
            max_tries: None,
            retry_interval_ms: None,
            max_concurrent: None,
            max_priority_fee_adjustment_bps: None,
            max_allowed_priority_fee_per_gas_gwei: None,
            gas_price_adjustment_bps: None,
            max_allowed_gas_price_gwei: None,
            max_fee_per_gas_gwei: None,
            priority_adjustment_factor_bps: None,
            gas_balance_update_interval_ms: None,
            low_gas_balance_warning_wei: None,
        }
    }

    #[test]
    fn chain_overrides_global_block_delay() {
        let global = global_with(&format!("0x{}", "11".repeat(32)));
        let mut chain = RawChainConfig {
            chain_id: 1,
            rpc: "ws://localhost:8545".into(),
            is_l1: None,
            block_delay: Some(2),
            monitor_interval_ms: None,
            underwrite_delay: None,
            max_underwrite_allowed: None,
            min_underwrite_reward: None,
            relative_min_underwrite_reward: None,
            underwrite_blocks_margin: None,
            underwrite_expiry_blocks: None,
            max_submission_delay_ms: None,
            allowance_buffer_bps: None,
            expire_blocks_margin: None,
            min_underwrite_duration_ms: None,
            max_pending_transactions: None,
            confirmations: None,
            confirmation_timeout_ms: None,
            max_tries: None,
            retry_interval_ms: None,
            max_concurrent: None,
            max_priority_fee_adjustment_bps: None,
            max_allowed_priority_fee_per_gas_gwei: None,
            gas_price_adjustment_bps: None,
            max_allowed_gas_price_gwei: None,
            max_fee_per_gas_gwei: None,
            priority_adjustment_factor_bps: None,
            gas_balance_update_interval_ms: None,
            low_gas_balance_warning_wei: None,
        };
        let resolved = chain.resolve(&global).unwrap();
        assert_eq!(resolved.block_delay, 2);

        chain.block_delay = None;
        let resolved = chain.resolve(&global).unwrap();
        assert_eq!(resolved.block_delay, 5);
    }

    #[test]
    fn min_underwrite_duration_floors_at_30_minutes() {
        let mut global = global_with(&format!("0x{}", "22".repeat(32)));
        global.min_underwrite_duration_ms = Some(60_000); // 1 minute, below floor
        let chain = RawChainConfig {
            chain_id: 1,
            rpc: "ws://localhost:8545".into(),
            is_l1: None,
            block_delay: None,
            monitor_interval_ms: None,
            underwrite_delay: None,
            max_underwrite_allowed: None,
            min_underwrite_reward: None,
            relative_min_underwrite_reward: None,
            underwrite_blocks_margin: None,
            underwrite_expiry_blocks: None,
            max_submission_delay_ms: None,
            allowance_buffer_bps: None,
            expire_blocks_margin: None,
            min_underwrite_duration_ms: None,
            max_pending_transactions: None,
            confirmations: None,
            confirmation_timeout_ms: None,
            max_tries: None,
            retry_interval_ms: None,
            max_concurrent: None,
            max_priority_fee_adjustment_bps: None,
            max_allowed_priority_fee_per_gas_gwei: None,
            gas_price_adjustment_bps: None,
            max_allowed_gas_price_gwei: None,
            max_fee_per_gas_gwei: None,
            priority_adjustment_factor_bps: None,
            gas_balance_update_interval_ms: None,
            low_gas_balance_warning_wei: None,
        };
        let resolved = chain.resolve(&global).unwrap();
        assert_eq!(resolved.min_underwrite_duration_ms, defaults::MIN_UNDERWRITE_DURATION_FLOOR_MS);
    }

    #[test]
    fn underwrite_expiry_blocks_falls_back_to_default_then_global_then_chain() {
        let global = global_with(&format!("0x{}", "33".repeat(32)));
        let mut chain = RawChainConfig {
            chain_id: 1,
            rpc: "ws://localhost:8545".into(),
            is_l1: None,
            block_delay: None,
            monitor_interval_ms: None,
            underwrite_delay: None,
            max_underwrite_allowed: None,
            min_underwrite_reward: None,
            relative_min_underwrite_reward: None,
            underwrite_blocks_margin: None,
            underwrite_expiry_blocks: None,
            max_submission_delay_ms: None,
            allowance_buffer_bps: None,
            expire_blocks_margin: None,
            min_underwrite_duration_ms: None,
            max_pending_transactions: None,
            confirmations: None,
            confirmation_timeout_ms: None,
            max_tries: None,
            retry_interval_ms: None,
            max_concurrent: None,
            max_priority_fee_adjustment_bps: None,
            max_allowed_priority_fee_per_gas_gwei: None,
            gas_price_adjustment_bps: None,
            max_allowed_gas_price_gwei: None,
            max_fee_per_gas_gwei: None,
            priority_adjustment_factor_bps: None,
            gas_balance_update_interval_ms: None,
            low_gas_balance_warning_wei: None,
        };
        assert_eq!(chain.resolve(&global).unwrap().underwrite_expiry_blocks, defaults::UNDERWRITE_EXPIRY_BLOCKS);

        let mut global_override = global.clone();
        global_override.underwrite_expiry_blocks = Some(1_000);
        assert_eq!(chain.resolve(&global_override).unwrap().underwrite_expiry_blocks, 1_000);

        chain.underwrite_expiry_blocks = Some(250);
        assert_eq!(chain.resolve(&global_override).unwrap().underwrite_expiry_blocks, 250);
    }
}
