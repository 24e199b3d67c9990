//! Background accrual polling.
//!
//! Claimed orders are pushed onto a bounded queue shared by a fixed pool of
//! workers. Each worker issues one poll at a time under a timeout, feeds the
//! observation into [`OrderLedger::apply`] and reschedules non-final orders
//! with [`RetryPolicy`] backoff. Orders that run out of attempts, or get an
//! answer we cannot act on, are flagged stalled for an operator.
//!
//! A periodic resync sweep re-enqueues every pending, non-stalled order, which
//! recovers jobs dropped on queue overflow, retry timers abandoned on shutdown,
//! and work lost across restarts.

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use tally_core::{AccrualError, AccrualObservation, AccrualSource, OrderNumber, OrderRepository};

use crate::error::LedgerError;
use crate::ledger::OrderLedger;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    pub resync_interval: Duration,
    /// Upper bound on orders fetched by one resync sweep.
    pub resync_batch: usize,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            poll_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            resync_interval: Duration::from_secs(30),
            resync_batch: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PollJob {
    number: OrderNumber,
    /// Polls already issued for this order in the current cycle.
    attempt: u32,
}

/// Producer side of the poll queue. Cheap to clone.
#[derive(Clone)]
pub struct PollQueue {
    tx: mpsc::Sender<PollJob>,
    in_flight: Arc<DashSet<OrderNumber>>,
}

impl PollQueue {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<PollJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            in_flight: Arc::new(DashSet::new()),
        };
        (queue, rx)
    }

    /// Queue a first poll for `number`. Never blocks.
    ///
    /// Returns false when the order is already queued or being retried, or
    /// when the queue is full or closed.
    pub fn enqueue(&self, number: OrderNumber) -> bool {
        if !self.in_flight.insert(number) {
            return false;
        }
        self.push(PollJob { number, attempt: 0 })
    }

    pub fn is_tracked(&self, number: OrderNumber) -> bool {
        self.in_flight.contains(&number)
    }

    // Caller already owns the in-flight slot
    fn push(&self, job: PollJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(order = %job.number, "poll queue full, leaving order for the next resync");
                self.release(job.number);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.release(job.number);
                false
            }
        }
    }

    fn release(&self, number: OrderNumber) {
        self.in_flight.remove(&number);
    }
}

/// What a worker does with an order after one poll.
#[derive(Debug, PartialEq)]
enum Next {
    Done,
    Retry { at_least: Option<Duration> },
    Stall,
}

struct Worker {
    source: Arc<dyn AccrualSource>,
    ledger: OrderLedger,
    orders: Arc<dyn OrderRepository>,
    queue: PollQueue,
    options: PollerOptions,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self: Arc<Self>, jobs: Arc<Mutex<mpsc::Receiver<PollJob>>>, id: usize) {
        debug!(worker = id, "accrual worker started");
        let mut shutdown = self.shutdown.clone();

        loop {
            let job = tokio::select! {
                _ = shutdown.changed() => break,
                job = async { jobs.lock().await.recv().await } => job,
            };
            let Some(job) = job else { break };

            // Not raced against shutdown: an apply in progress always completes
            self.process(job).await;
        }

        debug!(worker = id, "accrual worker stopped");
    }

    async fn process(self: &Arc<Self>, job: PollJob) {
        let next = self.poll_once(job.number).await;

        match next {
            Next::Done => self.queue.release(job.number),
            Next::Stall => self.stall(job.number).await,
            Next::Retry { at_least } => {
                let attempt = job.attempt + 1;
                if !self.options.retry.should_retry(attempt) {
                    warn!(order = %job.number, attempts = attempt, "accrual retries exhausted");
                    self.stall(job.number).await;
                    return;
                }

                let backoff = self.options.retry.delay_for_attempt(job.attempt);
                let delay = at_least.map_or(backoff, |floor| backoff.max(floor));
                self.schedule(PollJob { number: job.number, attempt }, delay);
            }
        }
    }

    async fn poll_once(&self, number: OrderNumber) -> Next {
        let observation = match timeout(self.options.poll_timeout, self.source.poll(number)).await {
            Ok(result) => result,
            Err(_) => Err(AccrualError::Timeout),
        };

        match observation {
            Ok(AccrualObservation::Known { status, accrual }) => {
                match self.ledger.apply(number, status, accrual).await {
                    Ok(_) if status.is_terminal() => Next::Done,
                    Ok(_) => Next::Retry { at_least: None },
                    // Already terminal locally; nothing further to learn from upstream
                    Err(LedgerError::InvalidTransition { from, .. }) if from.is_terminal() => {
                        Next::Done
                    }
                    // Upstream lags behind the local status; keep polling until it catches up
                    Err(LedgerError::InvalidTransition { from, to }) => {
                        warn!(
                            order = %number,
                            local = %from,
                            upstream = %to,
                            "upstream reported an older status"
                        );
                        Next::Retry { at_least: None }
                    }
                    Err(LedgerError::InvalidAmount) => {
                        error!(
                            order = %number,
                            accrual = ?accrual,
                            "upstream reported an unusable accrual"
                        );
                        Next::Stall
                    }
                    Err(LedgerError::OrderNotFound(_)) => {
                        error!(order = %number, "polled order disappeared from storage");
                        Next::Done
                    }
                    Err(e) => {
                        warn!(order = %number, error = %e, "failed to apply accrual observation");
                        Next::Retry { at_least: None }
                    }
                }
            }
            Ok(AccrualObservation::NotYetRegisteredUpstream) => {
                debug!(order = %number, "order not yet registered upstream");
                Next::Retry { at_least: None }
            }
            Ok(AccrualObservation::RateLimited { retry_after }) => {
                info!(order = %number, retry_after = ?retry_after, "accrual service rate limited");
                Next::Retry { at_least: retry_after }
            }
            Err(err @ AccrualError::Decode(_)) => {
                error!(order = %number, error = %err, "undecodable accrual response");
                Next::Retry { at_least: None }
            }
            Err(err) if err.is_retryable() => {
                warn!(order = %number, error = %err, "accrual poll failed");
                Next::Retry { at_least: None }
            }
            Err(err) => {
                error!(order = %number, error = %err, "accrual response cannot be acted on");
                Next::Stall
            }
        }
    }

    fn schedule(self: &Arc<Self>, job: PollJob, delay: Duration) {
        debug!(
            order = %job.number,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "re-poll scheduled"
        );
        let queue = self.queue.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {
                    queue.push(job);
                }
                _ = shutdown.changed() => {
                    queue.release(job.number);
                }
            }
        });
    }

    async fn stall(&self, number: OrderNumber) {
        match self.orders.flag_stalled(number).await {
            Ok(()) => warn!(order = %number, "order flagged stalled, left pending for review"),
            Err(e) => error!(order = %number, error = %e, "failed to flag stalled order"),
        }
        self.queue.release(number);
    }
}

/// Builds and starts the worker pool.
pub struct AccrualPoller {
    source: Arc<dyn AccrualSource>,
    ledger: OrderLedger,
    orders: Arc<dyn OrderRepository>,
    options: PollerOptions,
}

impl AccrualPoller {
    pub fn new(
        source: Arc<dyn AccrualSource>,
        ledger: OrderLedger,
        orders: Arc<dyn OrderRepository>,
        options: PollerOptions,
    ) -> Self {
        Self {
            source,
            ledger,
            orders,
            options,
        }
    }

    /// Spawn the workers and the resync sweep. Must be called inside a tokio runtime.
    pub fn start(self) -> PollerHandle {
        let (queue, rx) = PollQueue::new(self.options.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let jobs = Arc::new(Mutex::new(rx));

        let worker = Arc::new(Worker {
            source: self.source,
            ledger: self.ledger,
            orders: self.orders.clone(),
            queue: queue.clone(),
            options: self.options.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let mut tasks: Vec<JoinHandle<()>> = (0..self.options.workers.max(1))
            .map(|id| tokio::spawn(worker.clone().run(jobs.clone(), id)))
            .collect();

        tasks.push(tokio::spawn(resync_loop(
            self.orders,
            queue.clone(),
            self.options.resync_interval,
            self.options.resync_batch,
            shutdown_rx,
        )));

        info!(workers = self.options.workers.max(1), "accrual poller started");
        PollerHandle {
            queue,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

async fn resync_loop(
    orders: Arc<dyn OrderRepository>,
    queue: PollQueue,
    every: Duration,
    batch: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            // First tick fires immediately, which doubles as the startup sweep
            _ = ticker.tick() => {
                resync(orders.as_ref(), &queue, batch).await;
            }
        }
    }
}

async fn resync(orders: &dyn OrderRepository, queue: &PollQueue, batch: usize) -> usize {
    match orders.list_pending(batch).await {
        Ok(pending) => {
            let queued = pending.iter().filter(|o| queue.enqueue(o.number)).count();
            if queued > 0 {
                info!(queued, "resync queued pending orders");
            }
            queued
        }
        Err(e) => {
            error!(error = %e, "resync sweep failed to list pending orders");
            0
        }
    }
}

/// Running poller. Dropping it without [`PollerHandle::shutdown`] also stops the workers.
pub struct PollerHandle {
    queue: PollQueue,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn queue(&self) -> PollQueue {
        self.queue.clone()
    }

    /// Stop taking new jobs and wait for in-flight polls to finish applying.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "accrual poller task panicked");
            }
        }
        info!("accrual poller stopped");
    }
}
