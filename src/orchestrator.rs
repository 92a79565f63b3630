//! Orchestrator (§4.H): spawns one worker per `(chainId, role)`, wires the
//! pre-created ports between them, and watches for worker exit. Tasks are
//! used instead of OS threads since every worker suspends on I/O (RPC,
//! Store, wallet ports) and `tokio`'s runtime already spreads tasks across
//! OS threads, per §4.H.1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ethers::prelude::{LocalWallet, Provider, Signer, Ws};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::approval::ApprovalHandler;
use crate::config::{ResolvedChainConfig, ResolvedConfig, ResolvedEndpoint};
use crate::expirer;
use crate::listener::Listener;
use crate::monitor::Monitor;
use crate::queue::{ProcessingQueue, QueueConfig};
use crate::resolver::{HeightResolver, PassthroughResolver, UnimplementedL2Resolver};
use crate::rpc::client::WsClient;
use crate::store::{Store, StoreEvent, CHANNEL_EXPIRE_UNDERWRITE, CHANNEL_SEND_ASSET, CHANNEL_SWAP_UNDERWRITE_COMPLETE, CHANNEL_SWAP_UNDERWRITTEN};
use crate::types::UnderwriteKey;
use crate::underwriter::{self, pricing::UnitsAsExpectedOutOracle};
use crate::wallet::Wallet;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ChainQueueSnapshot {
    pub eval_size: usize,
    pub eval_retry: usize,
    pub submit_size: usize,
    pub submit_retry: usize,
    pub expire_eval_size: usize,
    pub expire_submit_size: usize,
}

/// Shared handle the HTTP server reads from (§6's status endpoint).
pub struct OrchestratorStatus {
    pub queues: DashMap<u64, ChainQueueSnapshot>,
    pub ready: Notify,
    pub started: std::sync::atomic::AtomicBool,
}

impl Default for OrchestratorStatus {
    fn default() -> Self {
        Self {
            queues: DashMap::new(),
            ready: Notify::new(),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

pub struct Orchestrator {
    pub store: Arc<Store>,
    pub status: Arc<OrchestratorStatus>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::new()),
            status: Arc::new(OrchestratorStatus::default()),
        }
    }

    /// Spawns every worker for every configured chain, then returns once all
    /// chains have connected. Runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, config: ResolvedConfig, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        let signer = LocalWallet::from_bytes(config.private_key.as_bytes())?;

        let endpoints_by_chain: HashMap<u64, ResolvedEndpoint> =
            config.endpoints.into_iter().map(|e| (e.chain_id, e)).collect();

        let mut handles = FuturesUnordered::new();

        for chain_config in config.chains {
            let Some(endpoint) = endpoints_by_chain.get(&chain_config.chain_id).cloned() else {
                warn!(chain_id = chain_config.chain_id, "no endpoint configured, skipping chain");
                continue;
            };
            let orchestrator = self.clone();
            let signer = signer.clone();
            let chain_shutdown = shutdown.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = orchestrator.run_chain(chain_config.clone(), endpoint, signer, chain_shutdown).await {
                    error!(fatal = true, chain_id = chain_config.chain_id, error = %e, "chain worker exited");
                }
            });
            handles.push(handle);
        }

        self.status.started.store(true, std::sync::atomic::Ordering::Relaxed);
        self.status.ready.notify_waiters();

        loop {
            tokio::select! {
                Some(result) = handles.next() => {
                    if let Err(e) = result {
                        error!(fatal = true, error = %e, "chain worker task panicked");
                    }
                    if handles.is_empty() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("orchestrator shutting down, waiting for chain workers to drain");
                        break;
                    }
                }
                else => break,
            }
        }

        Ok(())
    }

    async fn run_chain(
        self: Arc<Self>,
        chain_config: ResolvedChainConfig,
        endpoint: ResolvedEndpoint,
        signer: LocalWallet,
        shutdown: watch::Receiver<bool>,
    ) -> eyre::Result<()> {
        let chain_id = chain_config.chain_id;
        let own_address = signer.address();
        info!(chain_id, "connecting");
        let ws = Ws::connect(&chain_config.rpc).await?;
        let client: Arc<WsClient> = Arc::new(Provider::new(ws).interval(Duration::from_millis(100)));

        let (monitor, tip) = Monitor::new(chain_id, chain_config.block_delay);
        let resolver: Arc<dyn HeightResolver> = if chain_config.is_l1 {
            Arc::new(PassthroughResolver)
        } else {
            Arc::new(UnimplementedL2Resolver::default())
        };
        tokio::spawn(monitor.clone().run_poll(client.clone(), resolver, chain_config.monitor_interval_ms));

        let listener = Arc::new(Listener::new(
            chain_id,
            endpoint.clone(),
            self.store.clone(),
            chain_config.underwrite_expiry_blocks,
        ));
        tokio::spawn(listener.run(client.clone()));

        let (wallet, requests) = Wallet::new(chain_id, client.clone(), signer.clone().with_chain_id(chain_id), &chain_config).await?;
        tokio::spawn(
            wallet
                .clone()
                .run(requests, shutdown.clone()),
        );
        tokio::spawn(
            wallet
                .clone()
                .run_balance_watchdog(chain_config.gas_balance_update_interval_ms, chain_config.low_gas_balance_warning_wei),
        );

        let approval = Arc::new(ApprovalHandler::new(wallet.attach_to_wallet()));

        self.run_underwriter_pipeline(&chain_config, &endpoint, tip.clone(), wallet.attach_to_wallet(), approval);
        self.run_expirer_pipeline(&chain_config, &endpoint, tip, own_address, wallet.attach_to_wallet());

        self.run_status_timer(chain_id);

        std::future::pending::<()>().await;
        Ok(())
    }

    fn run_underwriter_pipeline(
        self: &Arc<Self>,
        chain_config: &ResolvedChainConfig,
        endpoint: &ResolvedEndpoint,
        tip: watch::Receiver<crate::monitor::BlockTip>,
        wallet_handle: crate::wallet::WalletHandle,
        approval: Arc<ApprovalHandler>,
    ) {
        let store = self.store.clone();
        let status = self.status.clone();
        let chain_config = chain_config.clone();
        let interface = endpoint.interface;
        let chain_id = chain_config.chain_id;

        tokio::spawn(async move {
            let oracle = Arc::new(UnitsAsExpectedOutOracle);
            let mut eval_queue = ProcessingQueue::new(
                Arc::new(underwriter::EvalHandler::new(store.clone(), tip.clone(), chain_config.clone(), oracle)),
                QueueConfig {
                    max_concurrent: chain_config.max_concurrent,
                    max_tries: chain_config.max_tries,
                    retry_interval: Duration::from_millis(chain_config.retry_interval_ms),
                },
            );
            let mut submit_queue = ProcessingQueue::new(
                Arc::new(underwriter::SubmitHandler::new(interface, approval, wallet_handle, store.clone())),
                QueueConfig {
                    max_concurrent: chain_config.max_concurrent,
                    max_tries: chain_config.max_tries,
                    retry_interval: Duration::from_millis(chain_config.retry_interval_ms),
                },
            );

            let mut pending: std::collections::VecDeque<(UnderwriteKey, u64)> = std::collections::VecDeque::new();
            let mut send_asset_rx = store.on(CHANNEL_SEND_ASSET);
            let mut ticker = tokio::time::interval(Duration::from_millis(200));

            loop {
                tokio::select! {
                    event = send_asset_rx.recv() => {
                        if let Ok(StoreEvent::SendAsset(state)) = event {
                            pending.push_back((state.key, state.event_block_number));
                        }
                    }
                    _ = ticker.tick() => {
                        let current_block = tip.borrow().block_number;
                        while let Some((key, event_block)) = pending.front() {
                            let capacity_free = eval_queue.size() + submit_queue.size() < chain_config.max_pending_transactions;
                            let delay_elapsed = underwriter::underwrite_delay_elapsed(*event_block, chain_config.underwrite_delay, current_block);
                            if capacity_free && delay_elapsed {
                                let (key, _) = pending.pop_front().unwrap();
                                eval_queue.add_orders([underwriter::EvalOrder { key }]);
                            } else {
                                break;
                            }
                        }

                        eval_queue.process_orders().await;
                        let (successes, rejections, eval_retry) = eval_queue.get_finished_orders();
                        for (_order, underwrite_order, _) in successes {
                            submit_queue.add_orders([underwrite_order]);
                        }
                        for (order, error, _) in rejections {
                            warn!(chain_id, underwrite_id = %order.key.underwrite_id, %error, "underwrite eval rejected");
                        }

                        submit_queue.process_orders().await;
                        let (_successes, rejections, submit_retry) = submit_queue.get_finished_orders();
                        for (order, error, _) in rejections {
                            warn!(chain_id, underwrite_id = %order.key.underwrite_id, %error, "underwrite submission rejected");
                        }

                        {
                            let mut snapshot = status.queues.entry(chain_id).or_default();
                            snapshot.eval_size = eval_queue.size();
                            snapshot.eval_retry = eval_retry;
                            snapshot.submit_size = submit_queue.size();
                            snapshot.submit_retry = submit_retry;
                        }
                    }
                }
            }
        });
    }

    fn run_expirer_pipeline(
        self: &Arc<Self>,
        chain_config: &ResolvedChainConfig,
        endpoint: &ResolvedEndpoint,
        tip: watch::Receiver<crate::monitor::BlockTip>,
        own_address: ethers::types::Address,
        wallet_handle: crate::wallet::WalletHandle,
    ) {
        let store = self.store.clone();
        let status = self.status.clone();
        let chain_config = chain_config.clone();
        let interface = endpoint.interface;
        let chain_id = chain_config.chain_id;
        let expire_blocks_margin = chain_config.expire_blocks_margin;

        tokio::spawn(async move {
            let mut eval_queue = ProcessingQueue::new(
                Arc::new(expirer::EvalHandler::new(store.clone(), chain_config.clone())),
                QueueConfig {
                    max_concurrent: chain_config.max_concurrent,
                    max_tries: chain_config.max_tries,
                    retry_interval: Duration::from_millis(chain_config.retry_interval_ms),
                },
            );
            let mut submit_queue = ProcessingQueue::new(
                Arc::new(expirer::SubmitHandler::new(interface, wallet_handle)),
                QueueConfig {
                    max_concurrent: chain_config.max_concurrent,
                    max_tries: chain_config.max_tries,
                    retry_interval: Duration::from_millis(chain_config.retry_interval_ms),
                },
            );

            let mut admission = expirer::ExpiryAdmission::new();
            let mut underwritten_rx = store.on(CHANNEL_SWAP_UNDERWRITTEN);
            let mut complete_rx = store.on(CHANNEL_SWAP_UNDERWRITE_COMPLETE);
            let mut expired_rx = store.on(CHANNEL_EXPIRE_UNDERWRITE);
            let mut ticker = tokio::time::interval(Duration::from_millis(200));

            loop {
                tokio::select! {
                    event = underwritten_rx.recv() => {
                        if let Ok(StoreEvent::SwapUnderwritten(key)) = event {
                            if let Ok(Some(state)) = store.get_active_underwrite_state(&key) {
                                admission.admit(key, state.expiry_block, state.underwriter, own_address, expire_blocks_margin);
                            }
                        }
                    }
                    event = complete_rx.recv() => {
                        if let Ok(StoreEvent::SwapUnderwriteComplete(key)) = event {
                            admission.remove(&key);
                        }
                    }
                    event = expired_rx.recv() => {
                        if let Ok(StoreEvent::ExpireUnderwrite(key)) = event {
                            admission.remove(&key);
                        }
                    }
                    _ = ticker.tick() => {
                        let current_block = tip.borrow().block_number;
                        for key in admission.drain_ready(current_block) {
                            eval_queue.add_orders([underwriter::EvalOrder { key }]);
                        }

                        eval_queue.process_orders().await;
                        let (successes, rejections, eval_retry) = eval_queue.get_finished_orders();
                        for (_order, expire_order, _) in successes {
                            submit_queue.add_orders([expire_order]);
                        }
                        for (order, error, _) in rejections {
                            warn!(chain_id, underwrite_id = %order.key.underwrite_id, %error, "expire eval rejected");
                        }

                        submit_queue.process_orders().await;
                        let (_successes, rejections, submit_retry) = submit_queue.get_finished_orders();
                        for (order, error, _) in rejections {
                            warn!(chain_id, underwrite_id = %order.key.underwrite_id, %error, "expire submission rejected");
                        }

                        {
                            let mut snapshot = status.queues.entry(chain_id).or_default();
                            snapshot.expire_eval_size = eval_queue.size() + eval_retry;
                            snapshot.expire_submit_size = submit_queue.size() + submit_retry;
                        }
                    }
                }
            }
        });
    }

    fn run_status_timer(self: &Arc<Self>, chain_id: u64) {
        let status = self.status.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
            loop {
                ticker.tick().await;
                if let Some(snapshot) = status.queues.get(&chain_id) {
                    info!(
                        chain_id,
                        eval_size = snapshot.eval_size,
                        eval_retry = snapshot.eval_retry,
                        submit_size = snapshot.submit_size,
                        submit_retry = snapshot.submit_retry,
                        expire_eval_size = snapshot.expire_eval_size,
                        expire_submit_size = snapshot.expire_submit_size,
                        "queue status"
                    );
                }
            }
        });
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
