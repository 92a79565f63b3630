//! Per-chain block-tip broadcaster (§4.B). Either polls `getBlock(latest -
//! blockDelay)` on an interval, or drives a relay WebSocket feed; either way
//! it multiplexes onto one `watch` channel so subscribers only ever see the
//! current tip, never a backlog.

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::Middleware;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::resolver::HeightResolver;
use crate::rpc::client::WsClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockTip {
    pub block_number: u64,
    pub block_hash: ethers::types::H256,
    pub timestamp: u64,
}

/// Inbound relay-mode wire message, validated loosely against §6's schema
/// before use: unknown `event` values are logged and ignored.
#[derive(Debug, Deserialize)]
struct RelayMessage {
    event: String,
    #[serde(default)]
    data: Option<RelayBlockData>,
}

#[derive(Debug, Deserialize)]
struct RelayBlockData {
    #[serde(rename = "chainId")]
    chain_id: String,
    #[serde(rename = "blockNumber")]
    block_number: u64,
    #[serde(rename = "blockHash")]
    block_hash: ethers::types::H256,
    timestamp: u64,
}

pub struct Monitor {
    chain_id: u64,
    block_delay: u64,
    sender: watch::Sender<BlockTip>,
}

impl Monitor {
    pub fn new(chain_id: u64, block_delay: u64) -> (Arc<Self>, watch::Receiver<BlockTip>) {
        let (sender, receiver) = watch::channel(BlockTip::default());
        (
            Arc::new(Self {
                chain_id,
                block_delay,
                sender,
            }),
            receiver,
        )
    }

    /// Ports never replay, only the next advance — a fresh clone of the
    /// `watch::Receiver` starts "caught up" to whatever the last broadcast
    /// tip was, per §4.B.
    pub fn attach_to_monitor(&self) -> watch::Receiver<BlockTip> {
        self.sender.subscribe()
    }

    fn apply_advance(&self, resolved_height: u64, hash: ethers::types::H256, timestamp: u64) {
        let broadcast_height = resolved_height.saturating_sub(self.block_delay);
        let advanced = self.sender.borrow().block_number < broadcast_height;
        if advanced {
            let tip = BlockTip {
                block_number: broadcast_height,
                block_hash: hash,
                timestamp,
            };
            debug!(chain_id = self.chain_id, block_number = broadcast_height, "tip advanced");
            let _ = self.sender.send(tip);
        }
    }

    /// Poll mode: queries `getBlock("latest")` on `interval`, resolves L2
    /// height via `resolver`, applies `blockDelay`.
    pub async fn run_poll(self: Arc<Self>, client: Arc<WsClient>, resolver: Arc<dyn HeightResolver>, interval_ms: u64) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            let block = match client.get_block(ethers::types::BlockNumber::Latest).await {
                Ok(Some(b)) => b,
                Ok(None) => continue,
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "poll: getBlock failed");
                    continue;
                }
            };
            let Some(number) = block.number else { continue };
            let resolved = match resolver.resolve(number.as_u64()).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "height resolution failed");
                    continue;
                }
            };
            let hash = block.hash.unwrap_or_default();
            let timestamp = block.timestamp.as_u64();
            self.apply_advance(resolved, hash, timestamp);
        }
    }

    /// Relay mode: connects to `ws://{host}:{port}`, sends the subscribe
    /// frame once, then applies every validated block push. Reconnects after
    /// `retry_interval_ms` on close, per §6.
    pub async fn run_relay(self: Arc<Self>, host: String, port: u16, retry_interval_ms: u64) {
        loop {
            let url = format!("ws://{host}:{port}");
            match tokio_tungstenite::connect_async(&url).await {
                Ok((mut ws, _)) => {
                    info!(chain_id = self.chain_id, url, "relay connected");
                    if ws
                        .send(Message::Text(r#"{"event":"monitor"}"#.to_string()))
                        .await
                        .is_err()
                    {
                        continue;
                    }
                    while let Some(msg) = ws.next().await {
                        match msg {
                            Ok(Message::Text(text)) => self.handle_relay_text(&text),
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                warn!(chain_id = self.chain_id, error = %e, "relay read error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "relay connect failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(retry_interval_ms)).await;
        }
    }

    fn handle_relay_text(&self, text: &str) {
        let parsed: RelayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(chain_id = self.chain_id, error = %e, "malformed relay frame");
                return;
            }
        };
        if parsed.event != "monitor" {
            debug!(chain_id = self.chain_id, event = parsed.event, "ignoring unknown relay event");
            return;
        }
        let Some(data) = parsed.data else { return };
        if data.chain_id.parse::<u64>().ok() != Some(self.chain_id) {
            return;
        }
        // Relay pushes are already L1-resolved by the relayer; apply block_delay directly.
        self.apply_advance(data.block_number, data.block_hash, data.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_applies_block_delay() {
        let (monitor, mut rx) = Monitor::new(1, 3);
        monitor.apply_advance(10, Default::default(), 100);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().block_number, 7);
    }

    #[test]
    fn stale_advance_is_ignored() {
        let (monitor, mut rx) = Monitor::new(1, 0);
        monitor.apply_advance(10, Default::default(), 100);
        rx.borrow_and_update();
        monitor.apply_advance(9, Default::default(), 101);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn saturating_delay_floors_at_zero() {
        let (monitor, mut rx) = Monitor::new(1, 100);
        monitor.apply_advance(5, Default::default(), 100);
        assert_eq!(rx.borrow_and_update().block_number, 0);
    }
}
