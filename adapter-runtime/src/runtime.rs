//! Generic adapter runtime
//!
//! [`AdapterRuntime`] wraps one [`ProtocolBinding`] and supplies everything
//! the bindings have in common: lifecycle, connection mode, incremental
//! cursor, duplicate filter, outbound batching and the result envelope.
//!
//! Batch buffer, cursor and duplicate filter live behind one async lock per
//! adapter instance, held for the whole operation. Operations of one adapter
//! therefore run one at a time; separate adapters share nothing.

use crate::{
    batch::{BatchAccumulator, BatchUnit},
    circuit_breaker::CircuitBreaker,
    config::{AdapterConfig, FlushFailurePolicy},
    connector::{Forward, ItemHandler, ProtocolBinding},
    cursor::{IncrementalCursor, Watermark},
    dedup::{ChecksumAlgorithm, DuplicateFilter, Fingerprinter},
    lifecycle::{AdapterState, Lifecycle},
    metrics::*,
    result::OperationResult,
    retry::with_timeout,
    session::{SessionLease, SessionManager},
    types::*,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of [`AdapterRuntime::send`]
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The payload, or the batch it completed, was delivered
    Delivered(DeliveryReceipt),
    /// The payload waits in the batch buffer
    Accumulated {
        /// Items now buffered
        buffered: usize,
    },
}

struct SharedState {
    batch: BatchAccumulator<Payload>,
    cursor: IncrementalCursor,
    filter: DuplicateFilter,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

/// Adapter runtime for one binding instance
pub struct AdapterRuntime<B: ProtocolBinding> {
    id: String,
    config: AdapterConfig,
    binding: Arc<B>,
    lifecycle: Lifecycle,
    sessions: SessionManager<B>,
    breaker: CircuitBreaker,
    fingerprinter: Fingerprinter,
    shared: Mutex<SharedState>,
    buffered: AtomicUsize,
    counters: Counters,
    last_activity: RwLock<DateTime<Utc>>,
}

impl<B: ProtocolBinding> AdapterRuntime<B> {
    /// Create a runtime; nothing is validated or connected before `initialize()`
    pub fn new(binding: B, config: AdapterConfig) -> Self {
        let binding = Arc::new(binding);
        let id = format!("{}-{}", binding.adapter_type(), Uuid::new_v4());
        // An invalid algorithm is rejected by initialize() before any use.
        let algorithm = config
            .checksum_algorithm()
            .unwrap_or(ChecksumAlgorithm::Sha256);

        Self {
            lifecycle: Lifecycle::new(id.clone()),
            sessions: SessionManager::new(id.clone(), binding.clone(), &config),
            breaker: CircuitBreaker::new(id.clone(), config.circuit_breaker.clone()),
            fingerprinter: Fingerprinter::new(algorithm, config.fingerprint_key.as_deref()),
            shared: Mutex::new(SharedState {
                batch: BatchAccumulator::from_config(&config),
                cursor: IncrementalCursor::new(config.cursor_column.clone()),
                filter: DuplicateFilter::new(
                    config.duplicate_strategy,
                    config.duplicate_capacity,
                    config.duplicate_window_ms,
                ),
            }),
            buffered: AtomicUsize::new(0),
            counters: Counters::default(),
            last_activity: RwLock::new(Utc::now()),
            id,
            config,
            binding,
        }
    }

    /// Adapter ID (`<TYPE>-<uuid>`)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configured display name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Adapter type
    pub fn adapter_type(&self) -> AdapterType {
        self.binding.adapter_type()
    }

    /// Direction
    pub fn mode(&self) -> AdapterMode {
        self.binding.mode()
    }

    /// Lifecycle state
    pub fn state(&self) -> AdapterState {
        self.lifecycle.state()
    }

    /// Configuration
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Protocol binding
    pub fn binding(&self) -> &B {
        &self.binding
    }

    /// Sessions currently open
    pub fn open_sessions(&self) -> usize {
        self.sessions.open_sessions()
    }

    /// Payloads waiting in the batch buffer
    pub fn buffered_items(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Time of the last completed operation
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    /// Snapshot of the incremental cursor
    pub async fn cursor(&self) -> IncrementalCursor {
        self.shared.lock().await.cursor.clone()
    }

    /// Validate configuration and, in permanent mode, open the session
    pub async fn initialize(&self) -> Result<()> {
        self.lifecycle.transition(AdapterState::Initializing)?;

        let prepared = async {
            self.config.validate()?;
            self.binding.validate()?;
            self.sessions.start().await
        }
        .await;

        if let Err(e) = prepared {
            error!("Adapter {} failed to initialize: {}", self.id, e);
            self.lifecycle.transition(AdapterState::Uninitialized)?;
            return Err(e);
        }

        self.lifecycle.transition(AdapterState::Ready)?;
        info!(
            "{} {} adapter '{}' initialized ({:?} connection)",
            self.adapter_type(),
            self.mode(),
            self.config.name,
            self.sessions.mode()
        );
        Ok(())
    }

    /// Run every connection check and report all of them
    ///
    /// Never short-circuits: reachability and each binding probe appear in
    /// the returned [`ConnectionReport`], also on failure.
    pub async fn test_connection(&self) -> OperationResult<ConnectionReport> {
        let started = Instant::now();
        if let Err(e) = self.lifecycle.ensure("testConnection", AdapterState::can_test) {
            return OperationResult::from_error("testConnection", &e)
                .with_metadata("operation", "testConnection")
                .with_duration_ms(elapsed_ms(started));
        }

        let _shared = self.shared.lock().await;
        let mut checks = Vec::new();
        let mut connect_error = None;

        match self.sessions.acquire().await {
            Ok(mut lease) => {
                checks.push(ProbeResult::pass(
                    "Connection",
                    format!("Connected ({:?} mode)", self.sessions.mode()),
                ));
                let probed = match lease.session() {
                    Ok(session) => {
                        with_timeout(self.config.operation_timeout(), "probe", async {
                            Ok(self.binding.probe(session).await)
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };
                self.return_lease(lease, probed.as_ref().err()).await;
                match probed {
                    Ok(results) => checks.extend(results),
                    Err(e) => checks.push(ProbeResult::fail("Probe", e.to_string())),
                }
            }
            Err(e) => {
                checks.push(ProbeResult::fail("Connection", e.to_string()));
                connect_error = Some(e);
            }
        }

        let report = ConnectionReport { checks };
        let total = report.checks.len();
        let failed = report.failures().count();
        let summary = report.summary();
        for check in report.failures() {
            warn!("Adapter {} check '{}' failed: {}", self.id, check.name, check.message);
        }

        let result = match connect_error {
            Some(e) => OperationResult::from_error("testConnection", &e).with_payload(report),
            None if failed == 0 => OperationResult::success(report, summary),
            None => OperationResult::failure(summary).with_payload(report),
        };

        self.touch();
        result
            .with_metadata("operation", "testConnection")
            .with_metadata("checksRun", total)
            .with_metadata("checksFailed", failed)
            .with_duration_ms(elapsed_ms(started))
    }

    /// Poll new items, returning the accepted ones
    pub async fn poll(&self) -> OperationResult<Vec<RawItem>> {
        self.poll_with(&Forward).await
    }

    /// Poll new items and hand each accepted one to `handler`
    ///
    /// An item is recorded in the duplicate filter only after the handler
    /// succeeded. The cursor advances only when no item failed. Every item
    /// that reached the filter is then acknowledged to the binding with its
    /// [`ItemOutcome`].
    pub async fn poll_with(&self, handler: &dyn ItemHandler) -> OperationResult<Vec<RawItem>> {
        self.execute("poll", self.poll_inner(handler)).await
    }

    /// Send one payload, through the batch buffer when batching is enabled
    pub async fn send(&self, payload: Payload) -> OperationResult<SendOutcome> {
        self.execute("send", self.send_inner(payload)).await
    }

    /// Deliver every payload on its own, reporting partial success
    ///
    /// Bypasses the batch buffer. With `continueOnError = false` the first
    /// failure stops the remaining deliveries.
    pub async fn send_batch(&self, payloads: Vec<Payload>) -> OperationResult<Vec<DeliveryReceipt>> {
        self.execute("sendBatch", self.send_batch_inner(payloads)).await
    }

    /// Flush the batch buffer now
    pub async fn flush(&self) -> OperationResult<Option<DeliveryReceipt>> {
        self.execute("flush", self.flush_inner(FlushTrigger::Manual))
            .await
    }

    /// Flush when a size or time condition holds; called by the scheduler
    pub async fn flush_if_due(&self) -> OperationResult<Option<DeliveryReceipt>> {
        let due = self.shared.lock().await.batch.due();
        match due {
            Some(trigger) => self.execute("flush", self.flush_inner(trigger)).await,
            None => OperationResult::success(None, "No flush due").with_metadata("operation", "flush"),
        }
    }

    /// Final flush, close sessions, clear state; not reversible
    pub async fn destroy(&self) -> OperationResult<()> {
        let started = Instant::now();
        let mut shared = self.shared.lock().await;
        let state = self.lifecycle.state();
        if state == AdapterState::Destroyed {
            let e = Error::InvalidState {
                operation: "destroy".to_string(),
                state,
            };
            return OperationResult::from_error("destroy", &e)
                .with_metadata("operation", "destroy")
                .with_duration_ms(elapsed_ms(started));
        }

        let mut flushed = 0usize;
        if state.can_execute() {
            if let Some(unit) = shared.batch.take(FlushTrigger::Shutdown) {
                let count = unit.items.len();
                let result = self.flush_unit(&mut shared, unit).await;
                if result.is_success() {
                    flushed = count;
                } else {
                    error!(
                        "Adapter {} final flush failed: {}",
                        self.id,
                        result.message()
                    );
                }
            }
        }

        let dropped = shared.batch.clear();
        if dropped > 0 {
            warn!("Adapter {} discarded {} buffered items on destroy", self.id, dropped);
        }
        shared.cursor.clear();
        shared.filter.clear();
        self.sync_buffered(&shared);

        if let Err(e) = self.lifecycle.transition(AdapterState::Destroyed) {
            return OperationResult::from_error("destroy", &e)
                .with_metadata("operation", "destroy")
                .with_duration_ms(elapsed_ms(started));
        }
        self.sessions.close().await;
        drop(shared);
        self.remove_gauges();

        self.touch();
        info!("Adapter {} destroyed", self.id);
        OperationResult::success((), "Adapter destroyed")
            .with_metadata("operation", "destroy")
            .with_metadata("flushedCount", flushed)
            .with_metadata("droppedCount", dropped)
            .with_duration_ms(elapsed_ms(started))
    }

    /// Configuration summary for operators
    pub fn describe(&self) -> String {
        format!(
            "{} {} adapter '{}' [{}]\n  State: {}\n  Connection mode: {:?}\n  Batch strategy: {:?}\n  Last activity: {}\n  {}",
            self.adapter_type(),
            self.mode(),
            self.config.name,
            self.id,
            self.state(),
            self.sessions.mode(),
            self.config.batch_strategy,
            self.last_activity().to_rfc3339(),
            self.binding.describe()
        )
    }

    /// Health snapshot
    pub fn health(&self) -> AdapterHealth {
        let state = self.state();
        let circuit_breaker_open = self.breaker.is_open();
        let status = match state {
            _ if circuit_breaker_open => HealthStatus::Unhealthy,
            AdapterState::Ready | AdapterState::Active => HealthStatus::Healthy,
            AdapterState::Faulted => HealthStatus::Degraded,
            AdapterState::Uninitialized | AdapterState::Initializing | AdapterState::Destroyed => {
                HealthStatus::Unhealthy
            }
        };

        AdapterHealth {
            adapter_id: self.id.clone(),
            adapter_type: self.adapter_type(),
            mode: self.mode(),
            state,
            status,
            last_activity: self.last_activity(),
            total_operations: self.counters.total.load(Ordering::SeqCst),
            successful_operations: self.counters.successful.load(Ordering::SeqCst),
            failed_operations: self.counters.failed.load(Ordering::SeqCst),
            circuit_breaker_open,
            buffered_items: self.buffered_items(),
            open_sessions: self.open_sessions(),
        }
    }

    async fn execute<T>(
        &self,
        operation: &'static str,
        body: impl Future<Output = OperationResult<T>>,
    ) -> OperationResult<T> {
        let started = Instant::now();
        if let Err(e) = self.lifecycle.ensure(operation, AdapterState::can_execute) {
            return OperationResult::from_error(operation, &e)
                .with_metadata("operation", operation)
                .with_duration_ms(elapsed_ms(started));
        }

        // Rejections say nothing about the endpoint and are not recorded.
        if let Err(e) = self.breaker.is_request_allowed() {
            warn!("Adapter {} rejected {}: {}", self.id, operation, e);
            let result = OperationResult::from_error(operation, &e);
            ADAPTER_OPERATIONS_TOTAL
                .with_label_values(&[
                    self.adapter_type().to_string().as_str(),
                    operation,
                    result.kind().as_str(),
                ])
                .inc();
            return result
                .with_metadata("operation", operation)
                .with_duration_ms(elapsed_ms(started));
        }

        let result = body.await;
        self.record(operation, started, result)
    }

    fn record<T>(&self, operation: &'static str, started: Instant, result: OperationResult<T>) -> OperationResult<T> {
        let elapsed = started.elapsed();
        let success = result.is_success();

        self.counters.total.fetch_add(1, Ordering::SeqCst);
        if success {
            self.counters.successful.fetch_add(1, Ordering::SeqCst);
            self.breaker.record_success();
        } else {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = result.error_kind() {
                self.breaker.record_failure(kind);
            }
            warn!("Adapter {} {} failed: {}", self.id, operation, result.message());
        }
        self.lifecycle.record_outcome(success);
        self.touch();

        let adapter_type = self.adapter_type().to_string();
        ADAPTER_OPERATIONS_TOTAL
            .with_label_values(&[adapter_type.as_str(), operation, result.kind().as_str()])
            .inc();
        ADAPTER_OPERATION_DURATION
            .with_label_values(&[adapter_type.as_str(), operation])
            .observe(elapsed.as_secs_f64());

        result
            .with_metadata("operation", operation)
            .with_duration_ms(elapsed.as_millis() as u64)
    }

    /// Take the state lock, re-checking the lifecycle under it
    async fn lock(&self, operation: &str) -> Result<MutexGuard<'_, SharedState>> {
        let guard = self.shared.lock().await;
        self.lifecycle.ensure(operation, AdapterState::can_execute)?;
        Ok(guard)
    }

    async fn poll_inner(&self, handler: &dyn ItemHandler) -> OperationResult<Vec<RawItem>> {
        let mut shared = match self.lock("poll").await {
            Ok(shared) => shared,
            Err(e) => return OperationResult::from_error("poll", &e),
        };

        // One session covers the fetch and every acknowledgement
        let mut lease = match self.sessions.acquire().await {
            Ok(lease) => lease,
            Err(e) => return OperationResult::from_error("poll", &e),
        };
        let fetched = match lease.session() {
            Ok(session) => {
                with_timeout(
                    self.config.operation_timeout(),
                    "fetch",
                    self.binding.fetch(session, &shared.cursor),
                )
                .await
            }
            Err(e) => Err(e),
        };
        let items = match fetched {
            Ok(items) => items,
            Err(e) => {
                self.return_lease(lease, Some(&e)).await;
                return OperationResult::from_error("poll", &e);
            }
        };

        if items.is_empty() {
            self.return_lease(lease, None).await;
            return OperationResult::success(Vec::new(), "No new data").with_metadata("fetchedCount", 0);
        }

        let mut accepted = Vec::new();
        let mut duplicates = 0usize;
        let mut stale = 0usize;
        let mut failed = 0usize;
        let mut unacknowledged = 0usize;
        let mut first_error: Option<Error> = None;

        for item in &items {
            if !shared.cursor.admits(&item.fields) {
                debug!("Adapter {} skipping '{}' at or below watermark", self.id, item.key);
                stale += 1;
                continue;
            }

            let (outcome, stop) = match self.accept_item(&mut shared.filter, handler, item).await {
                Ok(true) => {
                    accepted.push(item.clone());
                    (ItemOutcome::Processed, false)
                }
                Ok(false) => {
                    duplicates += 1;
                    (ItemOutcome::Duplicate, false)
                }
                Err(e) => {
                    failed += 1;
                    warn!("Adapter {} failed to process '{}': {}", self.id, item.key, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    (ItemOutcome::Failed, !self.config.continue_on_error)
                }
            };

            if !self.acknowledge(&mut lease, item, outcome).await {
                unacknowledged += 1;
            }
            if stop {
                break;
            }
        }
        self.return_lease(lease, None).await;

        if failed == 0 {
            shared.cursor.advance(&items);
        }
        let watermark = shared
            .cursor
            .watermark()
            .map(Watermark::to_json)
            .unwrap_or(Value::Null);

        let fetched = items.len();
        let accepted_count = accepted.len();
        let result = match first_error {
            None if accepted_count == 0 => OperationResult::success(
                accepted,
                format!("No new data ({} duplicates, {} already processed)", duplicates, stale),
            ),
            None => OperationResult::success(accepted, format!("Polled {} items", accepted_count)),
            Some(e) if accepted_count > 0 && self.config.continue_on_error => {
                OperationResult::partial_success(
                    accepted,
                    format!("Polled {} items, {} failed", accepted_count, failed),
                )
                .with_cause(e.to_string())
            }
            Some(e) => OperationResult::from_error("poll", &e).with_payload(accepted),
        };

        result
            .with_metadata("fetchedCount", fetched)
            .with_metadata("acceptedCount", accepted_count)
            .with_metadata("duplicatesSkipped", duplicates)
            .with_metadata("staleSkipped", stale)
            .with_metadata("failedCount", failed)
            .with_metadata("unacknowledgedCount", unacknowledged)
            .with_metadata("watermark", watermark)
    }

    /// Report an item's outcome to the binding; false when that failed
    ///
    /// The outcome itself stands: a processed item stays processed.
    async fn acknowledge(&self, lease: &mut SessionLease<B>, item: &RawItem, outcome: ItemOutcome) -> bool {
        let acknowledged = match lease.session() {
            Ok(session) => {
                with_timeout(
                    self.config.operation_timeout(),
                    "acknowledge",
                    self.binding.acknowledge(session, item, outcome),
                )
                .await
            }
            Err(e) => Err(e),
        };
        match acknowledged {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Adapter {} could not settle '{}' as {}: {}",
                    self.id,
                    item.key,
                    outcome.as_str(),
                    e
                );
                false
            }
        }
    }

    async fn accept_item(
        &self,
        filter: &mut DuplicateFilter,
        handler: &dyn ItemHandler,
        item: &RawItem,
    ) -> Result<bool> {
        let fingerprint = self.fingerprinter.fingerprint(&item.content)?;
        if !filter.should_accept(&item.key, &fingerprint) {
            DUPLICATES_SKIPPED_TOTAL
                .with_label_values(&[self.adapter_type().to_string().as_str()])
                .inc();
            return Ok(false);
        }

        handler.handle(item).await?;
        filter.record_accepted(&item.key, &fingerprint);
        Ok(true)
    }

    async fn send_inner(&self, payload: Payload) -> OperationResult<SendOutcome> {
        let mut shared = match self.lock("send").await {
            Ok(shared) => shared,
            Err(e) => return OperationResult::from_error("send", &e),
        };

        if !self.config.batching_enabled() {
            let size = payload.content.len();
            return match self.deliver(&Delivery::single(payload)).await {
                Ok(receipt) => delivered(receipt, format!("Delivered {} bytes", size))
                    .map(SendOutcome::Delivered),
                Err(e) => OperationResult::from_error("send", &e),
            };
        }

        let result = match shared.batch.push(payload) {
            Some(unit) => self
                .flush_unit(&mut shared, unit)
                .await
                .map(SendOutcome::Delivered),
            None => {
                let buffered = shared.batch.len();
                OperationResult::success(
                    SendOutcome::Accumulated { buffered },
                    format!("Payload accumulated ({} buffered)", buffered),
                )
                .with_metadata("bufferedCount", buffered)
            }
        };
        self.sync_buffered(&shared);
        result
    }

    async fn send_batch_inner(&self, payloads: Vec<Payload>) -> OperationResult<Vec<DeliveryReceipt>> {
        let _shared = match self.lock("sendBatch").await {
            Ok(shared) => shared,
            Err(e) => return OperationResult::from_error("sendBatch", &e),
        };

        let total = payloads.len();
        let mut receipts = Vec::with_capacity(total);
        let mut failed = 0usize;
        let mut first_error: Option<Error> = None;

        for (index, payload) in payloads.into_iter().enumerate() {
            match self.deliver(&Delivery::single(payload)).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => {
                    failed += 1;
                    warn!("Adapter {} failed to send payload #{}: {}", self.id, index, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    if !self.config.continue_on_error {
                        break;
                    }
                }
            }
        }

        let succeeded = receipts.len();
        let result = match first_error {
            None => OperationResult::success(receipts, format!("Sent {} payloads", succeeded)),
            Some(e) if succeeded > 0 => OperationResult::partial_success(
                receipts,
                format!("Sent {} of {} payloads", succeeded, total),
            )
            .with_cause(e.to_string()),
            Some(e) => OperationResult::from_error("sendBatch", &e),
        };

        result
            .with_metadata("successCount", succeeded)
            .with_metadata("failureCount", failed)
            .with_metadata("totalCount", total)
    }

    async fn flush_inner(&self, trigger: FlushTrigger) -> OperationResult<Option<DeliveryReceipt>> {
        let mut shared = match self.lock("flush").await {
            Ok(shared) => shared,
            Err(e) => return OperationResult::from_error("flush", &e),
        };

        let result = match shared.batch.take(trigger) {
            Some(unit) => self.flush_unit(&mut shared, unit).await.map(Some),
            None => OperationResult::success(None, "Nothing to flush"),
        };
        self.sync_buffered(&shared);
        result
    }

    /// Deliver a cut batch; the buffer no longer holds its items
    async fn flush_unit(&self, shared: &mut SharedState, unit: BatchUnit<Payload>) -> OperationResult<DeliveryReceipt> {
        let BatchUnit {
            sequence,
            items,
            trigger,
        } = unit;
        let count = items.len();
        let delivery = Delivery {
            sequence: Some(sequence),
            trigger: Some(trigger),
            items,
        };
        let adapter_type = self.adapter_type().to_string();

        match self.deliver(&delivery).await {
            Ok(receipt) => {
                BATCH_FLUSHES_TOTAL
                    .with_label_values(&[adapter_type.as_str(), trigger.as_str(), "success"])
                    .inc();
                info!(
                    "Adapter {} flushed batch #{} ({} items, {})",
                    self.id,
                    sequence,
                    count,
                    trigger.as_str()
                );
                delivered(receipt, format!("Flushed batch #{} with {} items", sequence, count))
                    .with_metadata("batchSequence", sequence)
                    .with_metadata("trigger", trigger.as_str())
                    .with_metadata("itemCount", count)
            }
            Err(e) => {
                BATCH_FLUSHES_TOTAL
                    .with_label_values(&[adapter_type.as_str(), trigger.as_str(), "failure"])
                    .inc();
                let result = OperationResult::from_error("flush", &e)
                    .with_metadata("batchSequence", sequence)
                    .with_metadata("trigger", trigger.as_str())
                    .with_metadata("itemCount", count);

                match self.config.flush_failure_policy {
                    FlushFailurePolicy::Drop => {
                        error!(
                            "Adapter {} dropped batch #{} ({} items): {}",
                            self.id, sequence, count, e
                        );
                        result.with_metadata("droppedCount", count)
                    }
                    FlushFailurePolicy::Requeue => {
                        warn!(
                            "Adapter {} requeued batch #{} ({} items): {}",
                            self.id, sequence, count, e
                        );
                        shared.batch.requeue(delivery.items);
                        result.with_metadata("requeuedCount", count)
                    }
                }
            }
        }
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryReceipt> {
        let mut lease = self.sessions.acquire().await?;
        let outcome = match lease.session() {
            Ok(session) => {
                with_timeout(
                    self.config.operation_timeout(),
                    "deliver",
                    self.binding.deliver(session, delivery),
                )
                .await
            }
            Err(e) => Err(e),
        };
        self.return_lease(lease, outcome.as_ref().err()).await;
        outcome
    }

    /// Release the lease; transient failures also drop a held session
    async fn return_lease(&self, lease: SessionLease<B>, error: Option<&Error>) {
        match error {
            Some(e) if e.is_retryable() => self.sessions.discard(lease).await,
            _ => self.sessions.release(lease).await,
        }
    }

    fn sync_buffered(&self, shared: &SharedState) {
        let buffered = shared.batch.len();
        self.buffered.store(buffered, Ordering::SeqCst);
        BUFFERED_ITEMS
            .with_label_values(&[self.id.as_str()])
            .set(buffered as i64);
    }

    /// Drop this instance's gauge series; the id is never reused
    fn remove_gauges(&self) {
        let labels = [self.id.as_str()];
        if BUFFERED_ITEMS.remove_label_values(&labels).is_err() {
            debug!("Adapter {} had no buffered items gauge", self.id);
        }
        if SESSIONS_OPEN.remove_label_values(&labels).is_err() {
            debug!("Adapter {} had no open sessions gauge", self.id);
        }
    }

    fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }
}

fn delivered(receipt: DeliveryReceipt, message: String) -> OperationResult<DeliveryReceipt> {
    let reference = receipt.reference.clone();
    let bytes_written = receipt.bytes_written;
    OperationResult::success(receipt, message)
        .with_metadata("reference", reference)
        .with_metadata("bytesWritten", bytes_written)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
