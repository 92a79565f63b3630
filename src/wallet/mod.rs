//! Per-chain wallet: serializes every outbound transaction for one signing
//! key (§4.D). Two internal `ProcessingQueue` instances compose it — submit
//! and confirm — reusing the exact retry/deadline machinery of §4.A rather
//! than a bespoke loop, with an `AtomicU64` nonce and tracked pending
//! transactions, plus a fee-market abstraction and port protocol on top.

pub mod fees;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip1559::Eip1559TransactionRequest;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use ethers::providers::Middleware;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{error, info, warn};

use crate::config::ResolvedChainConfig;
use crate::error::{Subsystem, UnderwriterError};
use crate::queue::{HandleOutcome, OrderHandler, ProcessingQueue, QueueConfig, QueueOrder};
use crate::rpc::client::WsClient;
use fees::{compute_fees, increased_fees, FeeConfig, GasFields, QueriedFeeData};

#[derive(Debug, Clone, Default)]
pub struct WalletOptions {
    pub retry_on_nonce_confirmation_error: bool,
}

/// What a caller submits through the port.
#[derive(Debug, Clone)]
pub struct WalletTransactionRequest {
    pub tx_request: TypedTransaction,
    pub metadata: serde_json::Value,
    pub options: WalletOptions,
}

#[derive(Debug, Clone)]
pub enum WalletOutcome {
    Confirmed(TransactionReceipt),
    SubmissionError(UnderwriterError),
    ConfirmationError(UnderwriterError),
}

/// Reply. `metadata` is echoed verbatim for caller correlation, per §4.D.
#[derive(Debug, Clone)]
pub struct WalletReply {
    pub metadata: serde_json::Value,
    pub outcome: WalletOutcome,
}

pub struct Envelope {
    request: WalletTransactionRequest,
    reply: oneshot::Sender<WalletReply>,
}

/// A handle to the wallet's port. Cloneable; many pipeline workers share one
/// wallet per chain.
#[derive(Clone)]
pub struct WalletHandle {
    sender: mpsc::Sender<Envelope>,
}

impl WalletHandle {
    pub async fn submit(&self, request: WalletTransactionRequest) -> eyre::Result<WalletReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Envelope { request, reply: reply_tx })
            .await
            .map_err(|_| eyre::eyre!("wallet port closed"))?;
        reply_rx.await.map_err(|_| eyre::eyre!("wallet dropped reply"))
    }
}

#[derive(Debug, Clone)]
struct SubmitOrder {
    message_id: u64,
    tx_request: TypedTransaction,
    metadata: serde_json::Value,
    options: WalletOptions,
}

impl QueueOrder for SubmitOrder {
    fn id(&self) -> String {
        self.message_id.to_string()
    }
}

#[derive(Debug, Clone)]
struct PendingTxOrder {
    message_id: u64,
    nonce: u64,
}

impl QueueOrder for PendingTxOrder {
    fn id(&self) -> String {
        format!("nonce={}", self.nonce)
    }
}

struct PendingTx {
    hashes: Vec<H256>,
    tx: TypedTransaction,
    gas_fields: GasFields,
    submitted_at: Instant,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

struct WalletInner {
    chain_id: u64,
    address: Address,
    signer: LocalWallet,
    client: Arc<WsClient>,
    nonce: AtomicU64,
    message_ids: AtomicU64,
    pending: DashMap<u64, PendingTx>,
    replies: DashMap<u64, (oneshot::Sender<WalletReply>, serde_json::Value)>,
    semaphore: Arc<Semaphore>,
    fee_config: FeeConfig,
    confirmations: u64,
    confirmation_timeout_ms: u64,
    max_tries: u32,
}

impl WalletInner {
    fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::SeqCst)
    }

    async fn query_fee_data(&self) -> eyre::Result<QueriedFeeData> {
        let block = self
            .client
            .get_block(ethers::types::BlockNumber::Latest)
            .await?
            .ok_or_else(|| eyre::eyre!("no latest block"))?;
        let base_fee = block.base_fee_per_gas.unwrap_or_default();
        let priority = self.client.estimate_eip1559_fees(None).await.ok().map(|(_, p)| p);
        let gas_price = self.client.get_gas_price().await.unwrap_or(base_fee);
        Ok(QueriedFeeData {
            base_fee,
            max_priority_fee_per_gas: priority,
            gas_price,
        })
    }

    async fn sign_and_broadcast(&self, tx: &TypedTransaction) -> eyre::Result<H256> {
        let signature = self.signer.sign_transaction(tx).await?;
        let raw = tx.rlp_signed(&signature);
        let pending = self.client.send_raw_transaction(raw).await?;
        Ok(pending.tx_hash())
    }
}

fn apply_gas_fields(tx: &mut TypedTransaction, fields: GasFields) {
    match fields {
        GasFields::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => {
            if let TypedTransaction::Eip1559(inner) = tx {
                inner.max_fee_per_gas = Some(max_fee_per_gas);
                inner.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
            } else {
                let mut inner = Eip1559TransactionRequest::new();
                inner.to = tx.to().cloned();
                inner.value = tx.value().copied();
                inner.data = tx.data().cloned();
                inner.chain_id = tx.chain_id();
                inner.max_fee_per_gas = Some(max_fee_per_gas);
                inner.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
                *tx = TypedTransaction::Eip1559(inner);
            }
        }
        GasFields::Legacy { gas_price } => {
            tx.set_gas_price(gas_price);
        }
    }
}

fn is_nonce_taken(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("nonce too low") || lower.contains("already known") || lower.contains("replacement transaction underpriced")
}

struct SubmitHandler {
    inner: Arc<WalletInner>,
}

#[async_trait::async_trait]
impl OrderHandler<SubmitOrder> for SubmitHandler {
    type Result = PendingTxOrder;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Wallet
    }

    async fn handle_order(&self, order: &SubmitOrder, _retry_count: u32) -> Result<HandleOutcome<PendingTxOrder>, UnderwriterError> {
        let permit = self.inner.semaphore.clone().acquire_owned().await.map_err(|e| UnderwriterError::Upstream {
            subsystem: Subsystem::Wallet,
            reason: format!("semaphore closed: {e}"),
        })?;

        let nonce = self.inner.nonce.fetch_add(1, Ordering::SeqCst);

        let queried = self.inner.query_fee_data().await.map_err(|e| UnderwriterError::Upstream {
            subsystem: Subsystem::Wallet,
            reason: e.to_string(),
        })?;
        let gas_fields = compute_fees(queried, &self.inner.fee_config, false);

        let mut tx = order.tx_request.clone();
        tx.set_nonce(U256::from(nonce));
        tx.set_chain_id(self.inner.chain_id);
        apply_gas_fields(&mut tx, gas_fields);

        match self.inner.sign_and_broadcast(&tx).await {
            Ok(hash) => {
                self.inner.pending.insert(
                    nonce,
                    PendingTx {
                        hashes: vec![hash],
                        tx,
                        gas_fields,
                        submitted_at: Instant::now(),
                        _permit: permit,
                    },
                );
                Ok(HandleOutcome::Settled(PendingTxOrder {
                    message_id: order.message_id,
                    nonce,
                }))
            }
            Err(e) => {
                let reason = e.to_string();
                if is_nonce_taken(&reason) {
                    if let Ok(confirmed) = self.inner.client.get_transaction_count(self.inner.address, None).await {
                        self.inner.nonce.store(confirmed.as_u64(), Ordering::SeqCst);
                    }
                    if !order.options.retry_on_nonce_confirmation_error {
                        return Err(UnderwriterError::Submission {
                            subsystem: Subsystem::Wallet,
                            reason,
                            unrecoverable: true,
                        });
                    }
                }
                Err(UnderwriterError::Submission {
                    subsystem: Subsystem::Wallet,
                    reason,
                    unrecoverable: false,
                })
            }
        }
    }
}

struct ConfirmHandler {
    inner: Arc<WalletInner>,
}

#[async_trait::async_trait]
impl OrderHandler<PendingTxOrder> for ConfirmHandler {
    type Result = TransactionReceipt;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Wallet
    }

    async fn handle_order(&self, order: &PendingTxOrder, _retry_count: u32) -> Result<HandleOutcome<TransactionReceipt>, UnderwriterError> {
        let Some(pending) = self.inner.pending.get(&order.nonce) else {
            return Err(UnderwriterError::Validation {
                subsystem: Subsystem::Wallet,
                reason: format!("no pending tx tracked for nonce {}", order.nonce),
            });
        };
        let hashes = pending.hashes.clone();
        let submitted_at = pending.submitted_at;
        let gas_fields = pending.gas_fields;
        let tx_template = pending.tx.clone();
        drop(pending);

        let current_block = self
            .inner
            .client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .unwrap_or(0);

        for hash in hashes.iter().rev() {
            if let Ok(Some(receipt)) = self.inner.client.get_transaction_receipt(*hash).await {
                let mined_at = receipt.block_number.map(|n| n.as_u64()).unwrap_or(current_block);
                if current_block.saturating_sub(mined_at) + 1 >= self.inner.confirmations {
                    self.inner.pending.remove(&order.nonce);
                    return Ok(HandleOutcome::Settled(receipt));
                }
                // Mined but not yet past the confirmation floor; keep waiting.
                return Err(UnderwriterError::Upstream {
                    subsystem: Subsystem::Wallet,
                    reason: "awaiting confirmations".into(),
                });
            }
        }

        if Instant::now() < submitted_at + Duration::from_millis(self.inner.confirmation_timeout_ms) {
            return Err(UnderwriterError::Upstream {
                subsystem: Subsystem::Wallet,
                reason: "awaiting first confirmation".into(),
            });
        }

        // Timed out without a receipt. Check whether some other transaction
        // consumed this nonce out-of-band before bumping fees.
        let confirmed_nonce = self
            .inner
            .client
            .get_transaction_count(self.inner.address, None)
            .await
            .map(|n| n.as_u64())
            .unwrap_or(order.nonce);
        if confirmed_nonce > order.nonce {
            self.inner.pending.remove(&order.nonce);
            return Err(UnderwriterError::NonceConsumedElsewhere {
                subsystem: Subsystem::Wallet,
                nonce: order.nonce,
            });
        }

        // `hashes` holds the original broadcast plus every fee-replacement
        // issued so far; the budget below gates actual replacements, not
        // confirmation polls, so it lives on this count rather than the
        // queue's own retry_count (see the queue config comment in `run`).
        let replacements_issued = hashes.len() as u32 - 1;
        if replacements_issued >= self.inner.max_tries {
            self.inner.pending.remove(&order.nonce);
            return Err(UnderwriterError::ConfirmationExceeded {
                subsystem: Subsystem::Wallet,
                attempts: replacements_issued,
            });
        }

        let fresh = self.inner.query_fee_data().await.map_err(|e| UnderwriterError::Upstream {
            subsystem: Subsystem::Wallet,
            reason: e.to_string(),
        })?;
        let bumped = increased_fees(gas_fields, fresh, &self.inner.fee_config);

        let mut replacement = tx_template;
        apply_gas_fields(&mut replacement, bumped);

        match self.inner.sign_and_broadcast(&replacement).await {
            Ok(new_hash) => {
                if let Some(mut entry) = self.inner.pending.get_mut(&order.nonce) {
                    entry.hashes.push(new_hash);
                    entry.gas_fields = bumped;
                    entry.tx = replacement;
                    entry.submitted_at = Instant::now();
                }
                warn!(chain_id = self.inner.chain_id, nonce = order.nonce, attempt = replacements_issued + 1, "replaced transaction by fee");
                Err(UnderwriterError::Upstream {
                    subsystem: Subsystem::Wallet,
                    reason: "replacement broadcast, awaiting confirmation".into(),
                })
            }
            Err(e) => Err(UnderwriterError::Upstream {
                subsystem: Subsystem::Wallet,
                reason: format!("replacement broadcast failed: {e}"),
            }),
        }
    }
}

pub struct Wallet {
    inner: Arc<WalletInner>,
    handle: WalletHandle,
}

impl Wallet {
    pub async fn new(chain_id: u64, client: Arc<WsClient>, signer: LocalWallet, config: &ResolvedChainConfig) -> eyre::Result<(Arc<Self>, mpsc::Receiver<Envelope>)> {
        let address = signer.address();
        let nonce = client.get_transaction_count(address, None).await?.as_u64();
        let (sender, receiver) = mpsc::channel(256);

        let inner = Arc::new(WalletInner {
            chain_id,
            address,
            signer,
            client,
            nonce: AtomicU64::new(nonce),
            message_ids: AtomicU64::new(0),
            pending: DashMap::new(),
            replies: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(config.max_pending_transactions)),
            fee_config: FeeConfig {
                max_priority_fee_adjustment_bps: config.max_priority_fee_adjustment_bps,
                max_allowed_priority_fee_per_gas_gwei: config.max_allowed_priority_fee_per_gas_gwei,
                gas_price_adjustment_bps: config.gas_price_adjustment_bps,
                max_allowed_gas_price_gwei: config.max_allowed_gas_price_gwei,
                max_fee_per_gas_gwei: config.max_fee_per_gas_gwei,
                priority_adjustment_factor_bps: config.priority_adjustment_factor_bps,
            },
            confirmations: config.confirmations,
            confirmation_timeout_ms: config.confirmation_timeout_ms,
            max_tries: config.max_tries,
        });

        let wallet = Arc::new(Self {
            inner,
            handle: WalletHandle { sender },
        });
        Ok((wallet, receiver))
    }

    pub fn attach_to_wallet(&self) -> WalletHandle {
        self.handle.clone()
    }

    fn reply(inner: &WalletInner, message_id: u64, outcome: WalletOutcome) {
        if let Some((_, (sender, metadata))) = inner.replies.remove(&message_id) {
            let _ = sender.send(WalletReply { metadata, outcome });
        }
    }

    /// Drives the submit → confirm pipeline. Runs until `shutdown` fires,
    /// draining in-flight orders up to a grace window, per §5.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<Envelope>, mut shutdown: watch::Receiver<bool>) {
        let queue_config = QueueConfig {
            max_concurrent: 16,
            max_tries: self.inner.max_tries,
            retry_interval: Duration::from_millis(1_000),
        };
        let mut submit_queue = ProcessingQueue::new(Arc::new(SubmitHandler { inner: self.inner.clone() }), queue_config);
        let mut confirm_queue = ProcessingQueue::new(
            Arc::new(ConfirmHandler { inner: self.inner.clone() }),
            QueueConfig {
                max_concurrent: 64,
                // Confirmation polling (`Upstream`, retryable) must not share
                // this budget with fee-replacement attempts: the handler
                // itself counts replacements against `max_tries` and returns
                // the terminal `ConfirmationExceeded`/`NonceConsumedElsewhere`
                // errors when that budget (or `confirmation_timeout_ms`) is
                // exhausted, and those reject immediately regardless of the
                // queue's own try count. Unbounded here so a slow first
                // confirmation is never force-rejected by poll count alone.
                max_tries: u32::MAX,
                retry_interval: Duration::from_millis(2_000),
            },
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(50));

        loop {
            tokio::select! {
                maybe_envelope = requests.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    let message_id = self.inner.next_message_id();
                    self.inner.replies.insert(message_id, (envelope.reply, envelope.request.metadata.clone()));
                    submit_queue.add_orders([SubmitOrder {
                        message_id,
                        tx_request: envelope.request.tx_request,
                        metadata: envelope.request.metadata,
                        options: envelope.request.options,
                    }]);
                }
                _ = ticker.tick() => {
                    submit_queue.process_orders().await;
                    let (successes, rejections, _) = submit_queue.get_finished_orders();
                    for (_order, pending_order, _) in successes {
                        confirm_queue.add_orders([pending_order]);
                    }
                    for (order, error, _) in rejections {
                        Self::reply(&self.inner, order.message_id, WalletOutcome::SubmissionError(error));
                    }

                    confirm_queue.process_orders().await;
                    let (successes, rejections, _) = confirm_queue.get_finished_orders();
                    for (order, receipt, _) in successes {
                        Self::reply(&self.inner, order.message_id, WalletOutcome::Confirmed(receipt));
                    }
                    for (order, error, _) in rejections {
                        Self::reply(&self.inner, order.message_id, WalletOutcome::ConfirmationError(error));
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(chain_id = self.inner.chain_id, "wallet draining in-flight orders before shutdown");
                        let grace = tokio::time::sleep(Duration::from_secs(10));
                        tokio::pin!(grace);
                        loop {
                            tokio::select! {
                                _ = &mut grace => break,
                                _ = ticker.tick() => {
                                    submit_queue.process_orders().await;
                                    confirm_queue.process_orders().await;
                                    if submit_queue.size() + submit_queue.retry_queue_len() == 0
                                        && confirm_queue.size() + confirm_queue.retry_queue_len() == 0 {
                                        break;
                                    }
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Periodically logs a warning if the native balance drops below
    /// `low_gas_balance_warning_wei`. Non-fatal, per §4.D.
    pub async fn run_balance_watchdog(self: Arc<Self>, interval_ms: u64, low_balance_warning: U256) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            match self.inner.client.get_balance(self.inner.address, None).await {
                Ok(balance) if balance < low_balance_warning => {
                    warn!(chain_id = self.inner.chain_id, balance = %balance, "low gas balance");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(chain_id = self.inner.chain_id, error = %e, "balance watchdog: failed to query balance");
                }
            }
        }
    }
}
