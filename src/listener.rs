//! Event listener (§2.1 supplemented feature): subscribes to
//! `SendAsset`/`SwapUnderwritten`/`FulfillUnderwrite` logs over the chain's
//! WebSocket provider and writes decoded events into the Store, publishing
//! on the matching channel. Named "external collaborator, interface only"
//! in §1, given a working body here so the Orchestrator has something real
//! to spawn.

use std::sync::Arc;

use ethers::contract::EthEvent;
use ethers::providers::Middleware;
use ethers::types::{Address, Filter, H256};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::abi::{FulfillUnderwriteFilter, SendAssetFilter, SwapUnderwrittenFilter};
use crate::config::ResolvedEndpoint;
use crate::rpc::client::WsClient;
use crate::store::{
    Store, StoreEvent, CHANNEL_EXPIRE_UNDERWRITE, CHANNEL_SEND_ASSET, CHANNEL_SWAP_UNDERWRITE_COMPLETE,
    CHANNEL_SWAP_UNDERWRITTEN,
};
use crate::types::{ActiveSwapState, UnderwriteId, UnderwriteKey, UnderwriteStatus};

pub struct Listener {
    chain_id: u64,
    endpoint: ResolvedEndpoint,
    store: Arc<Store>,
    underwrite_expiry_blocks: u64,
}

impl Listener {
    pub fn new(chain_id: u64, endpoint: ResolvedEndpoint, store: Arc<Store>, underwrite_expiry_blocks: u64) -> Self {
        Self { chain_id, endpoint, store, underwrite_expiry_blocks }
    }

    fn filter(&self) -> Filter {
        let mut addresses: Vec<Address> = self.endpoint.vaults.clone();
        addresses.push(self.endpoint.interface);
        let topics: Vec<H256> = vec![
            SendAssetFilter::signature(),
            SwapUnderwrittenFilter::signature(),
            FulfillUnderwriteFilter::signature(),
        ];
        Filter::new().address(addresses).topic0(topics)
    }

    pub async fn run(self: Arc<Self>, client: Arc<WsClient>) {
        let filter = self.filter();
        let mut stream = match client.subscribe_logs(&filter).await {
            Ok(s) => s,
            Err(e) => {
                error!(chain_id = self.chain_id, error = %e, "listener: failed to subscribe to logs");
                return;
            }
        };

        info!(chain_id = self.chain_id, "listener subscribed");

        while let Some(log) = stream.next().await {
            let Some(topic0) = log.topics.first().copied() else { continue };
            let block_number = log.block_number.map(|n| n.as_u64()).unwrap_or(0);

            if topic0 == SendAssetFilter::signature() {
                if let Ok(decoded) = ethers::contract::parse_log::<SendAssetFilter>(log.clone()) {
                    self.handle_send_asset(decoded, block_number);
                }
            } else if topic0 == SwapUnderwrittenFilter::signature() {
                if let Ok(decoded) = ethers::contract::parse_log::<SwapUnderwrittenFilter>(log.clone()) {
                    self.handle_swap_underwritten(decoded, block_number);
                }
            } else if topic0 == FulfillUnderwriteFilter::signature() {
                if let Ok(decoded) = ethers::contract::parse_log::<FulfillUnderwriteFilter>(log.clone()) {
                    self.handle_fulfill(decoded, block_number);
                }
            } else {
                debug!(chain_id = self.chain_id, "listener: unrecognized topic0, skipping");
            }
        }

        warn!(chain_id = self.chain_id, "listener: log stream ended");
    }

    fn handle_send_asset(&self, event: SendAssetFilter, block_number: u64) {
        let Some(to_account) = bytes_to_address(&event.to_account) else {
            warn!(chain_id = self.chain_id, "SendAsset: malformed toAccount, skipping");
            return;
        };
        let Some(to_vault) = bytes_to_address(&event.to_vault) else {
            warn!(chain_id = self.chain_id, "SendAsset: malformed toVault, skipping");
            return;
        };

        // The underwrite id is not known until a SwapUnderwritten event names
        // it; key provisionally on the swap fingerprint so the underwriter
        // pipeline's eval stage can find this record before that happens.
        let provisional_key = UnderwriteKey {
            to_chain_id: self.chain_id,
            to_interface: self.endpoint.interface,
            underwrite_id: UnderwriteId(H256::from_slice(&ethers::utils::keccak256(event.channel_id)[..])),
        };

        let state = ActiveSwapState {
            key: provisional_key.clone(),
            from_chain_id: self.chain_id,
            from_vault: self.endpoint.vaults.first().copied().unwrap_or_default(),
            channel_id: H256::from(event.channel_id),
            to_vault,
            to_account,
            from_asset: event.from_asset,
            to_asset: Address::zero(),
            from_amount: event.from_amount,
            min_out: event.min_out,
            units: event.units,
            fee: event.fee,
            underwrite_incentive_x16: event.underwrite_incentive_x16 as u32,
            calldata: Default::default(),
            event_block_number: block_number,
            event_block_timestamp_ms: 0,
            // Projected, not authoritative: the real expiry is only known once
            // `SwapUnderwritten` names it. Gives eval step 5 a margin to check
            // against before that point; `handle_swap_underwritten` (and the
            // submit-stage rekey) overwrite it with the on-chain value.
            expiry_block: block_number + self.underwrite_expiry_blocks,
            status: UnderwriteStatus::Pending,
            last_transition_block: block_number,
            underwriter: None,
        };

        if let Err(e) = self.store.save_swap_state(&state) {
            error!(chain_id = self.chain_id, error = %e, "failed to persist SendAsset state");
            return;
        }
        self.store.publish(CHANNEL_SEND_ASSET, StoreEvent::SendAsset(state));
    }

    fn handle_swap_underwritten(&self, event: SwapUnderwrittenFilter, block_number: u64) {
        let key = UnderwriteKey {
            to_chain_id: self.chain_id,
            to_interface: self.endpoint.interface,
            underwrite_id: UnderwriteId(H256::from(event.underwrite_id)),
        };
        if let Some(mut state) = self.store.get_active_underwrite_state(&key).unwrap_or(None) {
            state.status = UnderwriteStatus::Underwritten;
            state.underwriter = Some(event.underwriter);
            state.expiry_block = event.expiry.as_u64();
            state.last_transition_block = block_number;
            let _ = self.store.save_swap_state(&state);
        } else {
            warn!(chain_id = self.chain_id, underwrite_id = %key.underwrite_id, "SwapUnderwritten for unknown swap");
        }
        self.store.publish(CHANNEL_SWAP_UNDERWRITTEN, StoreEvent::SwapUnderwritten(key));
    }

    fn handle_fulfill(&self, event: FulfillUnderwriteFilter, block_number: u64) {
        let key = UnderwriteKey {
            to_chain_id: self.chain_id,
            to_interface: self.endpoint.interface,
            underwrite_id: UnderwriteId(H256::from(event.underwrite_id)),
        };
        if let Err(e) = self.store.transition_status(&key, UnderwriteStatus::Fulfilled, block_number) {
            error!(chain_id = self.chain_id, error = %e, "failed to transition to Fulfilled");
        }
        self.store.publish(CHANNEL_SWAP_UNDERWRITE_COMPLETE, StoreEvent::SwapUnderwriteComplete(key.clone()));
        self.store.publish(CHANNEL_EXPIRE_UNDERWRITE, StoreEvent::ExpireUnderwrite(key));
    }
}

/// Catalyst encodes `toAccount`/`toVault` as opaque bytes (they may be
/// non-EVM on the destination chain); on an EVM destination they are a
/// left-padded 20-byte address.
fn bytes_to_address(raw: &ethers::types::Bytes) -> Option<Address> {
    if raw.len() < 20 {
        return None;
    }
    Some(Address::from_slice(&raw[raw.len() - 20..]))
}
