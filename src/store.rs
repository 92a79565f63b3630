//! Key/value + pub-sub facade, shared between the listener and the
//! pipelines (§4.C). Backed by an in-process `DashMap`; values are
//! caller-serialized JSON, matching "no schema version" in §6.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{ActiveSwapState, UnderwriteKey, UnderwriteStatus};

pub const CHANNEL_SEND_ASSET: &str = "onSendAsset";
pub const CHANNEL_SWAP_UNDERWRITTEN: &str = "onSwapUnderwritten";
pub const CHANNEL_SWAP_UNDERWRITE_COMPLETE: &str = "onSwapUnderwriteComplete";
pub const CHANNEL_EXPIRE_UNDERWRITE: &str = "onExpireUnderwrite";

const CHANNEL_CAPACITY: usize = 1024;

/// Payload published on the named channels above. A plain enum of owned
/// values, not references, per §9's pub-sub guidance.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    SendAsset(ActiveSwapState),
    SwapUnderwritten(UnderwriteKey),
    SwapUnderwriteComplete(UnderwriteKey),
    ExpireUnderwrite(UnderwriteKey),
}

pub struct Store {
    kv: DashMap<String, Vec<u8>>,
    channels: DashMap<&'static str, broadcast::Sender<StoreEvent>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let channels = DashMap::new();
        for name in [
            CHANNEL_SEND_ASSET,
            CHANNEL_SWAP_UNDERWRITTEN,
            CHANNEL_SWAP_UNDERWRITE_COMPLETE,
            CHANNEL_EXPIRE_UNDERWRITE,
        ] {
            channels.insert(name, broadcast::channel(CHANNEL_CAPACITY).0);
        }
        Self { kv: DashMap::new(), channels }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> eyre::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv.insert(key.to_string(), bytes);
        Ok(())
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> eyre::Result<Option<T>> {
        match self.kv.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn del(&self, key: &str) {
        self.kv.remove(key);
    }

    /// Subscribe to a named channel. Late subscribers get only the next
    /// advance, never a replay, matching the Monitor's port contract.
    pub fn on(&self, channel: &'static str) -> broadcast::Receiver<StoreEvent> {
        self.channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, channel: &'static str, event: StoreEvent) {
        if let Some(sender) = self.channels.get(channel) {
            // No receivers is not an error; it just means nobody is subscribed yet.
            if sender.send(event).is_err() {
                warn!(channel, "publish had no subscribers");
            }
        }
    }

    pub fn get_active_underwrite_state(&self, key: &UnderwriteKey) -> eyre::Result<Option<ActiveSwapState>> {
        self.get(&key.store_key())
    }

    pub fn get_swap_state_by_expected_underwrite(&self, key: &UnderwriteKey) -> eyre::Result<Option<ActiveSwapState>> {
        self.get_active_underwrite_state(key)
    }

    pub fn save_swap_state(&self, state: &ActiveSwapState) -> eyre::Result<()> {
        self.set(&state.key.store_key(), state)
    }

    pub fn transition_status(&self, key: &UnderwriteKey, status: UnderwriteStatus, block: u64) -> eyre::Result<()> {
        if let Some(mut state) = self.get_active_underwrite_state(key)? {
            state.status = status;
            state.last_transition_block = block;
            self.save_swap_state(&state)?;
        }
        Ok(())
    }

    /// Moves a swap's record from the provisional `SendAsset`-derived key to
    /// the real, contract-assigned `underwriteId` once it is known, so later
    /// lookups by the real key (the expirer's admission path) find it. A
    /// no-op on the old key's absence: the listener may have already rekeyed
    /// the same record via its own `SwapUnderwritten` observation.
    pub fn rekey_swap_state(
        &self,
        old_key: &UnderwriteKey,
        new_key: UnderwriteKey,
        underwriter: ethers::types::Address,
        expiry_block: u64,
        block: u64,
    ) -> eyre::Result<Option<ActiveSwapState>> {
        let Some(mut state) = self.get_active_underwrite_state(old_key)? else {
            return Ok(None);
        };
        state.key = new_key;
        state.status = UnderwriteStatus::Underwritten;
        state.underwriter = Some(underwriter);
        state.expiry_block = expiry_block;
        state.last_transition_block = block;
        self.save_swap_state(&state)?;
        self.del(&old_key.store_key());
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, H256, U256};

    fn sample_state() -> ActiveSwapState {
        ActiveSwapState {
            key: UnderwriteKey {
                to_chain_id: 1,
                to_interface: Address::zero(),
                underwrite_id: crate::types::UnderwriteId(H256::zero()),
            },
            from_chain_id: 2,
            from_vault: Address::zero(),
            channel_id: H256::zero(),
            to_vault: Address::zero(),
            to_account: Address::zero(),
            from_asset: Address::zero(),
            to_asset: Address::zero(),
            from_amount: U256::from(100),
            min_out: U256::from(90),
            units: U256::from(100),
            fee: U256::zero(),
            underwrite_incentive_x16: 65,
            calldata: Bytes::default(),
            event_block_number: 10,
            event_block_timestamp_ms: 0,
            expiry_block: 510,
            status: UnderwriteStatus::Pending,
            last_transition_block: 10,
            underwriter: None,
        }
    }

    #[test]
    fn round_trips_swap_state() {
        let store = Store::new();
        let state = sample_state();
        store.save_swap_state(&state).unwrap();
        let loaded = store.get_active_underwrite_state(&state.key).unwrap().unwrap();
        assert_eq!(loaded.units, state.units);
        assert_eq!(loaded.status, UnderwriteStatus::Pending);
    }

    #[test]
    fn transition_updates_status_and_block() {
        let store = Store::new();
        let state = sample_state();
        store.save_swap_state(&state).unwrap();
        store.transition_status(&state.key, UnderwriteStatus::Underwritten, 15).unwrap();
        let loaded = store.get_active_underwrite_state(&state.key).unwrap().unwrap();
        assert_eq!(loaded.status, UnderwriteStatus::Underwritten);
        assert_eq!(loaded.last_transition_block, 15);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let store = Store::new();
        let mut rx = store.on(CHANNEL_SEND_ASSET);
        let state = sample_state();
        store.publish(CHANNEL_SEND_ASSET, StoreEvent::SendAsset(state.clone()));
        let event = rx.recv().await.unwrap();
        match event {
            StoreEvent::SendAsset(s) => assert_eq!(s.units, state.units),
            _ => panic!("wrong event variant"),
        }
    }

    #[test]
    fn rekey_moves_record_to_new_key_and_drops_old() {
        let store = Store::new();
        let state = sample_state();
        let old_key = state.key.clone();
        store.save_swap_state(&state).unwrap();

        let new_key = UnderwriteKey {
            to_chain_id: old_key.to_chain_id,
            to_interface: old_key.to_interface,
            underwrite_id: crate::types::UnderwriteId(H256::repeat_byte(7)),
        };
        let underwriter = Address::repeat_byte(9);
        let rekeyed = store
            .rekey_swap_state(&old_key, new_key.clone(), underwriter, 999, 20)
            .unwrap()
            .expect("old record was present");
        assert_eq!(rekeyed.key, new_key);
        assert_eq!(rekeyed.status, UnderwriteStatus::Underwritten);
        assert_eq!(rekeyed.underwriter, Some(underwriter));
        assert_eq!(rekeyed.expiry_block, 999);

        assert!(store.get_active_underwrite_state(&old_key).unwrap().is_none());
        let loaded = store.get_active_underwrite_state(&new_key).unwrap().unwrap();
        assert_eq!(loaded.underwriter, Some(underwriter));
    }

    #[test]
    fn rekey_is_a_noop_when_old_key_absent() {
        let store = Store::new();
        let old_key = UnderwriteKey {
            to_chain_id: 1,
            to_interface: Address::zero(),
            underwrite_id: crate::types::UnderwriteId(H256::zero()),
        };
        let new_key = UnderwriteKey {
            to_chain_id: 1,
            to_interface: Address::zero(),
            underwrite_id: crate::types::UnderwriteId(H256::repeat_byte(1)),
        };
        let result = store.rekey_swap_state(&old_key, new_key, Address::zero(), 100, 1).unwrap();
        assert!(result.is_none());
    }
}
