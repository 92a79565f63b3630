//! Generic processing queue: bounded concurrency, retry-with-backoff,
//! deadlines, completion fan-out.
//!
//! Parametric over an order type `O` and a handler `H: OrderHandler<O>`
//! supplying the three hooks (`handle_order`, `handle_failed_order`,
//! `on_order_completion`). No inheritance: the queue invokes an interface,
//! matching the re-architecture guidance for `EvalQueue extends ProcessingQueue`.
//! The wallet's confirm stage and both pipelines' eval/submit stages are all
//! instances of this same type, parameterized differently.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tracing::{debug, warn};

use crate::error::{Subsystem, UnderwriterError};

/// Minimal shape every order moving through a `ProcessingQueue` must have.
pub trait QueueOrder: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Stable identifier, used only for logging/correlation.
    fn id(&self) -> String;

    /// Monotonic deadline. `None` means the order never expires on its own.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// What `handle_order` may return: a settled result, a silent drop, or a
/// future the queue should await before deciding success/failure.
pub enum HandleOutcome<R> {
    Settled(R),
    Dropped,
    Pending(BoxFuture<'static, Result<R, UnderwriterError>>),
}

/// Terminal shape of one order's journey through the queue, passed to
/// `on_order_completion`. Dropped orders never reach this — they are
/// discarded silently, per spec.
#[derive(Debug, Clone)]
pub enum Outcome<R> {
    Success(R),
    Rejected(UnderwriterError),
}

/// The three hooks an implementer overrides. No inheritance: the queue holds
/// an `Arc<dyn OrderHandler<O, Result = R>>`-shaped value and calls through it.
#[async_trait]
pub trait OrderHandler<O: QueueOrder>: Send + Sync {
    type Result: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Tag used when the queue itself needs to report a panic or deadline
    /// violation without a more specific error from the handler.
    fn subsystem(&self) -> Subsystem;

    async fn handle_order(
        &self,
        order: &O,
        retry_count: u32,
    ) -> Result<HandleOutcome<Self::Result>, UnderwriterError>;

    /// Decide whether a failed order should be retried. Defaults to the
    /// error's own classification; override when a pipeline needs different
    /// semantics (e.g. the expirer never retries submission errors).
    async fn handle_failed_order(
        &self,
        _order: &O,
        _retry_count: u32,
        error: &UnderwriterError,
    ) -> bool {
        error.is_retryable()
    }

    /// Notification only; the queue does not act on the return value.
    async fn on_order_completion(&self, _order: &O, _outcome: &Outcome<Self::Result>, _retry_count: u32) {}
}

enum Resolution<R> {
    Success(R),
    Dropped,
    Failed(UnderwriterError),
}

struct QueueItem<O> {
    order: O,
    retry_count: u32,
}

struct RetryItem<O> {
    retry_at: Instant,
    item: QueueItem<O>,
}

impl<O> PartialEq for RetryItem<O> {
    fn eq(&self, other: &Self) -> bool {
        self.retry_at == other.retry_at
    }
}
impl<O> Eq for RetryItem<O> {}
impl<O> PartialOrd for RetryItem<O> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<O> Ord for RetryItem<O> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.retry_at.cmp(&other.retry_at)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Tuning knobs, resolved once per worker spawn (see `config::resolve`).
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_tries: u32,
    pub retry_interval: Duration,
}

pub struct ProcessingQueue<O: QueueOrder, H: OrderHandler<O>> {
    handler: Arc<H>,
    config: QueueConfig,
    new_orders: VecDeque<QueueItem<O>>,
    retry_heap: BinaryHeap<Reverse<RetryItem<O>>>,
    in_flight: FuturesUnordered<BoxFuture<'static, (O, u32, Resolution<H::Result>)>>,
    successes: Vec<(O, H::Result, u32)>,
    rejections: Vec<(O, UnderwriterError, u32)>,
}

impl<O: QueueOrder, H: OrderHandler<O> + 'static> ProcessingQueue<O, H> {
    pub fn new(handler: Arc<H>, config: QueueConfig) -> Self {
        Self {
            handler,
            config,
            new_orders: VecDeque::new(),
            retry_heap: BinaryHeap::new(),
            in_flight: FuturesUnordered::new(),
            successes: Vec::new(),
            rejections: Vec::new(),
        }
    }

    /// Append orders to the new-orders bucket. Dispatch happens on the next
    /// `process_orders` tick, preserving insertion order for first attempts.
    pub fn add_orders(&mut self, orders: impl IntoIterator<Item = O>) {
        for order in orders {
            self.new_orders.push_back(QueueItem {
                order,
                retry_count: 0,
            });
        }
    }

    pub fn size(&self) -> usize {
        self.new_orders.len() + self.in_flight.len()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_heap.len()
    }

    async fn reject(&mut self, order: O, retry_count: u32, error: UnderwriterError) {
        let handler = self.handler.clone();
        self.rejections.push((order.clone(), error.clone(), retry_count));
        handler
            .on_order_completion(&order, &Outcome::Rejected(error), retry_count)
            .await;
    }

    fn is_expired(order: &O, now: Instant) -> bool {
        order.deadline().map(|d| now > d).unwrap_or(false)
    }

    /// One scheduler tick: promote ready retries, dispatch up to
    /// `max_concurrent` new orders, then drain whatever in-flight work has
    /// already settled. Never blocks waiting on in-flight futures.
    pub async fn process_orders(&mut self) {
        let now = Instant::now();

        // (a) promote retry-ready items back to new-orders, front-loaded so
        // they are considered before orders that arrived this tick — the
        // spec only guarantees FIFO among first attempts, not against retries.
        let mut ready = Vec::new();
        while let Some(Reverse(top)) = self.retry_heap.peek() {
            if top.retry_at > now {
                break;
            }
            let Reverse(item) = self.retry_heap.pop().unwrap();
            ready.push(item.item);
        }
        for item in ready.into_iter().rev() {
            self.new_orders.push_front(item);
        }

        // (b) dispatch while capacity remains.
        while self.in_flight.len() < self.config.max_concurrent {
            let Some(item) = self.new_orders.pop_front() else {
                break;
            };

            if Self::is_expired(&item.order, now) {
                let subsystem = self.handler.subsystem();
                self.reject(
                    item.order,
                    item.retry_count,
                    UnderwriterError::DeadlineExceeded { subsystem },
                )
                .await;
                continue;
            }

            self.dispatch(item);
        }

        // (c) non-blocking drain of anything already settled.
        while let Some(Some((order, retry_count, resolution))) =
            self.in_flight.next().now_or_never()
        {
            self.settle(order, retry_count, resolution).await;
        }
    }

    fn dispatch(&mut self, item: QueueItem<O>) {
        let handler = self.handler.clone();
        let order = item.order;
        let retry_count = item.retry_count;

        let fut: BoxFuture<'static, (O, u32, Resolution<H::Result>)> = Box::pin(async move {
            let subsystem = handler.subsystem();
            let first = AssertUnwindSafe(handler.handle_order(&order, retry_count))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(UnderwriterError::Panicked {
                        subsystem,
                        message: panic_message(&*panic),
                    })
                });

            let resolution = match first {
                Ok(HandleOutcome::Settled(r)) => Resolution::Success(r),
                Ok(HandleOutcome::Dropped) => Resolution::Dropped,
                Ok(HandleOutcome::Pending(inner)) => {
                    match AssertUnwindSafe(inner).catch_unwind().await {
                        Ok(Ok(r)) => Resolution::Success(r),
                        Ok(Err(e)) => Resolution::Failed(e),
                        Err(panic) => Resolution::Failed(UnderwriterError::Panicked {
                            subsystem,
                            message: panic_message(&*panic),
                        }),
                    }
                }
                Err(e) => Resolution::Failed(e),
            };

            (order, retry_count, resolution)
        });

        self.in_flight.push(fut);
    }

    async fn settle(&mut self, order: O, retry_count: u32, resolution: Resolution<H::Result>) {
        match resolution {
            Resolution::Success(result) => {
                self.handler
                    .on_order_completion(&order, &Outcome::Success(result.clone()), retry_count)
                    .await;
                self.successes.push((order, result, retry_count));
            }
            Resolution::Dropped => {
                debug!(order = order.id(), "order dropped silently by handler");
            }
            Resolution::Failed(error) => {
                self.handle_failure(order, retry_count, error).await;
            }
        }
    }

    async fn handle_failure(&mut self, order: O, retry_count: u32, error: UnderwriterError) {
        let handler = self.handler.clone();
        let order_ref = order.clone();
        let error_ref = error.clone();
        let should_retry = AssertUnwindSafe(async {
            handler
                .handle_failed_order(&order_ref, retry_count, &error_ref)
                .await
        })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            warn!(
                order = order.id(),
                panic = panic_message(&*panic),
                "handle_failed_order panicked; force-rejecting"
            );
            false
        });

        let next_retry_count = retry_count + 1;
        if should_retry && next_retry_count < self.config.max_tries {
            if Self::is_expired(&order, Instant::now()) {
                let subsystem = self.handler.subsystem();
                self.reject(order, retry_count, UnderwriterError::DeadlineExceeded { subsystem })
                    .await;
                return;
            }
            self.retry_heap.push(Reverse(RetryItem {
                retry_at: Instant::now() + self.config.retry_interval,
                item: QueueItem {
                    order,
                    retry_count: next_retry_count,
                },
            }));
        } else {
            self.reject(order, retry_count, error).await;
        }
    }

    /// Drain everything finished since the last call: `(successes, rejections, pending)`.
    pub fn get_finished_orders(
        &mut self,
    ) -> (
        Vec<(O, H::Result, u32)>,
        Vec<(O, UnderwriterError, u32)>,
        usize,
    ) {
        (
            std::mem::take(&mut self.successes),
            std::mem::take(&mut self.rejections),
            self.size() + self.retry_queue_len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone)]
    struct TestOrder {
        id: u32,
        deadline: Option<Instant>,
    }

    impl QueueOrder for TestOrder {
        fn id(&self) -> String {
            self.id.to_string()
        }
        fn deadline(&self) -> Option<Instant> {
            self.deadline
        }
    }

    struct AlwaysSucceeds {
        calls: AtomicU32,
    }

    #[async_trait]
    impl OrderHandler<TestOrder> for AlwaysSucceeds {
        type Result = u32;

        fn subsystem(&self) -> Subsystem {
            Subsystem::Eval
        }

        async fn handle_order(
            &self,
            order: &TestOrder,
            _retry_count: u32,
        ) -> Result<HandleOutcome<u32>, UnderwriterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandleOutcome::Settled(order.id))
        }
    }

    struct FailsThenSucceeds {
        fail_until: u32,
    }

    #[async_trait]
    impl OrderHandler<TestOrder> for FailsThenSucceeds {
        type Result = u32;

        fn subsystem(&self) -> Subsystem {
            Subsystem::Wallet
        }

        async fn handle_order(
            &self,
            order: &TestOrder,
            retry_count: u32,
        ) -> Result<HandleOutcome<u32>, UnderwriterError> {
            if retry_count < self.fail_until {
                Err(UnderwriterError::Submission {
                    subsystem: Subsystem::Wallet,
                    reason: "simulated".into(),
                    unrecoverable: false,
                })
            } else {
                Ok(HandleOutcome::Settled(order.id))
            }
        }
    }

    #[tokio::test]
    async fn dispatches_in_insertion_order() {
        let handler = Arc::new(AlwaysSucceeds {
            calls: AtomicU32::new(0),
        });
        let mut queue = ProcessingQueue::new(
            handler,
            QueueConfig {
                max_concurrent: 8,
                max_tries: 3,
                retry_interval: Duration::from_millis(10),
            },
        );
        queue.add_orders(vec![
            TestOrder { id: 1, deadline: None },
            TestOrder { id: 2, deadline: None },
        ]);
        queue.process_orders().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.process_orders().await;
        let (successes, rejections, _) = queue.get_finished_orders();
        assert_eq!(rejections.len(), 0);
        let ids: Vec<u32> = successes.iter().map(|(o, _, _)| o.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn deadline_rejects_without_calling_handler() {
        let handler = Arc::new(AlwaysSucceeds {
            calls: AtomicU32::new(0),
        });
        let mut queue = ProcessingQueue::new(
            handler.clone(),
            QueueConfig {
                max_concurrent: 8,
                max_tries: 3,
                retry_interval: Duration::from_millis(10),
            },
        );
        queue.add_orders(vec![TestOrder {
            id: 1,
            deadline: Some(Instant::now() - Duration::from_secs(1)),
        }]);
        queue.process_orders().await;
        let (successes, rejections, _) = queue.get_finished_orders();
        assert_eq!(successes.len(), 0);
        assert_eq!(rejections.len(), 1);
        assert!(matches!(
            rejections[0].1,
            UnderwriterError::DeadlineExceeded { .. }
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_up_to_max_tries_then_rejects() {
        let handler = Arc::new(FailsThenSucceeds { fail_until: 10 });
        let mut queue = ProcessingQueue::new(
            handler,
            QueueConfig {
                max_concurrent: 8,
                max_tries: 3,
                retry_interval: Duration::from_millis(1),
            },
        );
        queue.add_orders(vec![TestOrder { id: 1, deadline: None }]);
        for _ in 0..5 {
            queue.process_orders().await;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        let (successes, rejections, _) = queue.get_finished_orders();
        assert_eq!(successes.len(), 0);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].2, 2); // retry_count at completion == max_tries - 1
    }

    #[tokio::test]
    async fn succeeds_after_retrying_within_budget() {
        let handler = Arc::new(FailsThenSucceeds { fail_until: 1 });
        let mut queue = ProcessingQueue::new(
            handler,
            QueueConfig {
                max_concurrent: 8,
                max_tries: 5,
                retry_interval: Duration::from_millis(1),
            },
        );
        queue.add_orders(vec![TestOrder { id: 1, deadline: None }]);
        for _ in 0..5 {
            queue.process_orders().await;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        let (successes, rejections, _) = queue.get_finished_orders();
        assert_eq!(rejections.len(), 0);
        assert_eq!(successes.len(), 1);
    }
}
