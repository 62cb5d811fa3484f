//! Runtime behaviour against an in-memory binding

use adapter_runtime::{
    circuit_breaker::CircuitBreakerConfig,
    config::{BatchStrategy, ConnectionMode, DuplicateStrategy, FlushFailurePolicy},
    cursor::{IncrementalCursor, Watermark},
    AdapterConfig, AdapterMode, AdapterRuntime, AdapterState, AdapterType, Delivery,
    DeliveryReceipt, Error, FlushTrigger, ItemHandler, OperationResult, OutcomeKind, Payload,
    ProbeResult, ProtocolBinding, RawItem, Result, SendOutcome,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// In-memory binding
// ============================================================================

#[derive(Default)]
struct Endpoint {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    dead: AtomicBool,
    refuse_connect: AtomicBool,
    hang: AtomicBool,
    failing_deliveries: AtomicUsize,
    rows: Mutex<Vec<RawItem>>,
    queries: Mutex<Vec<String>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl Endpoint {
    fn set_rows(&self, rows: Vec<RawItem>) {
        *self.rows.lock() = rows;
    }

    fn delivered(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }
}

struct MemoryBinding {
    mode: AdapterMode,
    endpoint: Arc<Endpoint>,
}

struct MemorySession;

#[async_trait]
impl ProtocolBinding for MemoryBinding {
    type Session = MemorySession;

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Jdbc
    }

    fn mode(&self) -> AdapterMode {
        self.mode
    }

    async fn connect(&self) -> Result<MemorySession> {
        if self.endpoint.refuse_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".into()));
        }
        self.endpoint.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession)
    }

    async fn disconnect(&self, _session: MemorySession) -> Result<()> {
        self.endpoint.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self, _session: &MemorySession) -> bool {
        !self.endpoint.dead.load(Ordering::SeqCst)
    }

    async fn probe(&self, _session: &mut MemorySession) -> Vec<ProbeResult> {
        vec![
            ProbeResult::pass("Authentication", "Credentials accepted"),
            ProbeResult::fail("Table Access", "permission denied for table orders"),
        ]
    }

    async fn fetch(&self, _session: &mut MemorySession, cursor: &IncrementalCursor) -> Result<Vec<RawItem>> {
        self.endpoint
            .queries
            .lock()
            .push(cursor.scope_query("SELECT * FROM orders"));
        Ok(self.endpoint.rows.lock().clone())
    }

    async fn deliver(&self, _session: &mut MemorySession, delivery: &Delivery) -> Result<DeliveryReceipt> {
        if self.endpoint.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let failing = self.endpoint.failing_deliveries.load(Ordering::SeqCst);
        if failing > 0 {
            self.endpoint
                .failing_deliveries
                .store(failing - 1, Ordering::SeqCst);
            return Err(Error::Processing("disk full".into()));
        }

        self.endpoint.deliveries.lock().push(delivery.clone());
        Ok(DeliveryReceipt {
            reference: format!("unit-{}", delivery.sequence.unwrap_or(0)),
            bytes_written: delivery.content_len() as u64,
            item_count: delivery.items.len(),
            metadata: Default::default(),
        })
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Fails every key in the set, once
struct FailOnce {
    keys: Mutex<HashSet<String>>,
}

#[async_trait]
impl ItemHandler for FailOnce {
    async fn handle(&self, item: &RawItem) -> Result<()> {
        if self.keys.lock().remove(&item.key) {
            return Err(Error::Processing(format!("downstream rejected {}", item.key)));
        }
        Ok(())
    }
}

fn adapter(mode: AdapterMode, config: AdapterConfig) -> (AdapterRuntime<MemoryBinding>, Arc<Endpoint>) {
    let endpoint = Arc::new(Endpoint::default());
    let binding = MemoryBinding {
        mode,
        endpoint: endpoint.clone(),
    };
    (AdapterRuntime::new(binding, config), endpoint)
}

fn row(key: &str, id: i64, content: &str) -> RawItem {
    RawItem::new(key, content.to_string()).with_field("id", id)
}

fn meta<T>(result: &OperationResult<T>, key: &str) -> Option<u64> {
    result.metadata_value(key).and_then(|v| v.as_u64())
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_operations_before_initialize_fail() {
    let (adapter, endpoint) = adapter(AdapterMode::Sender, AdapterConfig::default());

    let polled = adapter.poll().await;
    assert!(!polled.is_success());
    assert!(polled.message().contains("UNINITIALIZED"));
    assert!(!adapter.test_connection().await.is_success());
    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 0);
    assert_eq!(adapter.state(), AdapterState::Uninitialized);
}

#[tokio::test]
async fn test_invalid_config_keeps_adapter_uninitialized() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Size,
        batch_size: None,
        ..Default::default()
    };
    let (adapter, _) = adapter(AdapterMode::Receiver, config);

    let err = adapter.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Configuration { ref field, .. } if field == "batchSize"));
    assert_eq!(adapter.state(), AdapterState::Uninitialized);
}

#[tokio::test]
async fn test_state_follows_last_outcome() {
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, AdapterConfig::default());
    adapter.initialize().await.unwrap();
    assert_eq!(adapter.state(), AdapterState::Ready);

    endpoint.failing_deliveries.store(1, Ordering::SeqCst);
    assert!(!adapter.send(Payload::new("a")).await.is_success());
    assert_eq!(adapter.state(), AdapterState::Faulted);

    assert!(adapter.send(Payload::new("a")).await.is_success());
    assert_eq!(adapter.state(), AdapterState::Active);

    let health = adapter.health();
    assert_eq!(health.total_operations, 2);
    assert_eq!(health.failed_operations, 1);
}

#[tokio::test]
async fn test_destroy_flushes_and_is_terminal() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Size,
        batch_size: Some(10),
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();

    adapter.send(Payload::new("a")).await;
    adapter.send(Payload::new("b")).await;
    assert_eq!(adapter.buffered_items(), 2);

    let destroyed = adapter.destroy().await;
    assert!(destroyed.is_success());
    assert_eq!(meta(&destroyed, "flushedCount"), Some(2));

    let deliveries = endpoint.delivered();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].trigger, Some(FlushTrigger::Shutdown));
    assert_eq!(adapter.state(), AdapterState::Destroyed);
    assert_eq!(adapter.buffered_items(), 0);

    assert!(!adapter.destroy().await.is_success());
    assert!(!adapter.send(Payload::new("c")).await.is_success());
}

fn gauge_series(adapter_id: &str) -> Vec<String> {
    prometheus::gather()
        .iter()
        .filter(|family| {
            family.get_name() == "adapter_buffered_items" || family.get_name() == "adapter_sessions_open"
        })
        .flat_map(|family| {
            family
                .get_metric()
                .iter()
                .filter(move |metric| {
                    metric
                        .get_label()
                        .iter()
                        .any(|label| label.get_name() == "adapter_id" && label.get_value() == adapter_id)
                })
                .map(move |_| family.get_name().to_string())
        })
        .collect()
}

#[tokio::test]
async fn test_destroy_removes_instance_gauges() {
    let config = AdapterConfig {
        connection_mode: ConnectionMode::Permanent,
        batch_strategy: BatchStrategy::Size,
        batch_size: Some(10),
        ..Default::default()
    };
    let (adapter, _) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();
    adapter.send(Payload::new("a")).await;

    let mut before = gauge_series(adapter.id());
    before.sort();
    assert_eq!(before, vec!["adapter_buffered_items", "adapter_sessions_open"]);

    assert!(adapter.destroy().await.is_success());
    assert!(gauge_series(adapter.id()).is_empty());
}

// ============================================================================
// Connection modes
// ============================================================================

#[tokio::test]
async fn test_per_operation_sessions_always_released() {
    let config = AdapterConfig {
        connection_mode: ConnectionMode::PerOperation,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();
    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 0);

    assert!(adapter.send(Payload::new("a")).await.is_success());
    assert_eq!(adapter.open_sessions(), 0);

    endpoint.failing_deliveries.store(1, Ordering::SeqCst);
    assert!(!adapter.send(Payload::new("b")).await.is_success());
    assert_eq!(adapter.open_sessions(), 0);

    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 2);
    assert_eq!(endpoint.disconnects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_operation_releases_session() {
    let config = AdapterConfig {
        connection_mode: ConnectionMode::PerOperation,
        operation_timeout_ms: 50,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();

    endpoint.hang.store(true, Ordering::SeqCst);
    let result = adapter.send(Payload::new("a")).await;

    assert_eq!(result.kind(), OutcomeKind::Timeout);
    assert_eq!(adapter.open_sessions(), 0);
    assert_eq!(endpoint.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_permanent_session_reused_and_reconnected() {
    let config = AdapterConfig {
        connection_mode: ConnectionMode::Permanent,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Sender, config);
    adapter.initialize().await.unwrap();
    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 1);

    adapter.poll().await;
    adapter.poll().await;
    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.open_sessions(), 1);

    endpoint.dead.store(true, Ordering::SeqCst);
    assert!(adapter.poll().await.is_success());
    endpoint.dead.store(false, Ordering::SeqCst);

    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 2);
    assert_eq!(endpoint.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.open_sessions(), 1);

    adapter.destroy().await;
    assert_eq!(adapter.open_sessions(), 0);
}

#[tokio::test]
async fn test_connection_report_lists_every_check() {
    let (adapter, _) = adapter(AdapterMode::Sender, AdapterConfig::default());
    adapter.initialize().await.unwrap();

    let result = adapter.test_connection().await;
    assert!(!result.is_success());
    assert_eq!(meta(&result, "checksRun"), Some(3));
    assert_eq!(meta(&result, "checksFailed"), Some(1));

    let report = result.payload().unwrap();
    let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Connection", "Authentication", "Table Access"]);
    assert!(report.summary().contains("Table Access"));
    assert_eq!(adapter.open_sessions(), 0);
}

#[tokio::test]
async fn test_unreachable_endpoint_reports_connection_check() {
    let config = AdapterConfig {
        max_retry_attempts: 1,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Sender, config);
    adapter.initialize().await.unwrap();
    endpoint.refuse_connect.store(true, Ordering::SeqCst);

    let result = adapter.test_connection().await;
    assert_eq!(result.kind(), OutcomeKind::ConnectionError);
    let report = result.payload().unwrap();
    assert_eq!(report.checks.len(), 1);
    assert!(!report.checks[0].passed);
}

#[tokio::test]
async fn test_open_breaker_recovers_under_frequent_calls() {
    let config = AdapterConfig {
        max_retry_attempts: 1,
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            timeout_seconds: 1,
            success_threshold: 1,
        },
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();

    endpoint.refuse_connect.store(true, Ordering::SeqCst);
    assert_eq!(adapter.send(Payload::new("a")).await.kind(), OutcomeKind::ConnectionError);
    assert!(adapter.health().circuit_breaker_open);
    endpoint.refuse_connect.store(false, Ordering::SeqCst);

    let rejected = adapter.send(Payload::new("b")).await;
    assert!(rejected.message().contains("Circuit breaker open"));
    assert_eq!(adapter.state(), AdapterState::Faulted);

    // Calls arrive faster than the breaker timeout; rejections must not
    // push the half-open point further out.
    let mut recovered = false;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        if adapter.send(Payload::new("c")).await.is_success() {
            recovered = true;
            break;
        }
    }

    assert!(recovered);
    assert!(!adapter.health().circuit_breaker_open);
    assert_eq!(adapter.state(), AdapterState::Active);
    assert_eq!(adapter.health().failed_operations, 1);
    assert_eq!(endpoint.delivered().len(), 1);
}

// ============================================================================
// Incremental polling
// ============================================================================

#[tokio::test]
async fn test_cursor_scopes_query_and_skips_stale_rows() {
    let config = AdapterConfig {
        cursor_column: Some("id".into()),
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Sender, config);
    adapter.initialize().await.unwrap();

    endpoint.set_rows(vec![row("a", 5, "a"), row("b", 7, "b"), row("c", 3, "c")]);
    let first = adapter.poll().await;
    assert_eq!(first.payload().unwrap().len(), 3);
    assert_eq!(adapter.cursor().await.watermark(), Some(&Watermark::Integer(7)));

    endpoint.set_rows(vec![row("d", 9, "d"), row("b", 7, "b")]);
    let second = adapter.poll().await;
    let keys: Vec<String> = second.payload().unwrap().iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec!["d"]);
    assert_eq!(meta(&second, "staleSkipped"), Some(1));
    assert_eq!(adapter.cursor().await.watermark(), Some(&Watermark::Integer(9)));

    let queries = endpoint.queries.lock().clone();
    assert_eq!(queries[0], "SELECT * FROM orders ORDER BY id ASC");
    assert_eq!(queries[1], "SELECT * FROM orders WHERE id > 7 ORDER BY id ASC");
}

#[tokio::test]
async fn test_empty_poll_reports_no_new_data() {
    let (adapter, _) = adapter(AdapterMode::Sender, AdapterConfig::default());
    adapter.initialize().await.unwrap();

    let result = adapter.poll().await;
    assert!(result.is_success());
    assert!(result.payload().unwrap().is_empty());
    assert_eq!(result.message(), "No new data");
}

#[tokio::test]
async fn test_unmodified_redelivery_is_suppressed() {
    let config = AdapterConfig {
        duplicate_strategy: DuplicateStrategy::KeyAndFingerprint,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Sender, config);
    adapter.initialize().await.unwrap();

    endpoint.set_rows(vec![row("a.csv", 1, "x"), row("b.csv", 2, "y")]);
    assert_eq!(adapter.poll().await.payload().unwrap().len(), 2);

    let again = adapter.poll().await;
    assert!(again.payload().unwrap().is_empty());
    assert_eq!(meta(&again, "duplicatesSkipped"), Some(2));

    endpoint.set_rows(vec![row("a.csv", 1, "x2"), row("b.csv", 2, "y")]);
    let modified = adapter.poll().await;
    let keys: Vec<String> = modified.payload().unwrap().iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec!["a.csv"]);
}

#[tokio::test]
async fn test_failed_item_is_readmitted_and_cursor_held() {
    let config = AdapterConfig {
        cursor_column: Some("id".into()),
        duplicate_strategy: DuplicateStrategy::Key,
        continue_on_error: true,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Sender, config);
    adapter.initialize().await.unwrap();
    endpoint.set_rows(vec![row("a", 1, "a"), row("b", 2, "b")]);

    let handler = FailOnce {
        keys: Mutex::new(["b".to_string()].into_iter().collect()),
    };
    let first = adapter.poll_with(&handler).await;
    assert_eq!(first.kind(), OutcomeKind::PartialSuccess);
    assert_eq!(meta(&first, "failedCount"), Some(1));
    assert!(adapter.cursor().await.watermark().is_none());

    let second = adapter.poll_with(&handler).await;
    assert_eq!(second.kind(), OutcomeKind::Success);
    let keys: Vec<String> = second.payload().unwrap().iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec!["b"]);
    assert_eq!(meta(&second, "duplicatesSkipped"), Some(1));
    assert_eq!(adapter.cursor().await.watermark(), Some(&Watermark::Integer(2)));
}

// ============================================================================
// Outbound batching
// ============================================================================

#[tokio::test]
async fn test_size_batch_delivers_in_order() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Size,
        batch_size: Some(3),
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();

    for body in ["1", "2"] {
        let sent = adapter.send(Payload::new(body)).await;
        assert!(matches!(sent.payload(), Some(SendOutcome::Accumulated { .. })));
    }
    assert!(endpoint.delivered().is_empty());

    let sent = adapter.send(Payload::new("3")).await;
    assert!(matches!(sent.payload(), Some(SendOutcome::Delivered(_))));
    assert_eq!(adapter.buffered_items(), 0);

    let deliveries = endpoint.delivered();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].sequence, Some(1));
    assert_eq!(deliveries[0].trigger, Some(FlushTrigger::Size));
    let bodies: Vec<&[u8]> = deliveries[0].items.iter().map(|p| &p.content[..]).collect();
    assert_eq!(bodies, vec![&b"1"[..], &b"2"[..], &b"3"[..]]);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_batch_flushes_on_elapsed_time() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Mixed,
        batch_size: Some(5),
        batch_timeout_ms: Some(1000),
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();

    adapter.send(Payload::new("a")).await;
    tokio::time::advance(Duration::from_millis(400)).await;
    adapter.send(Payload::new("b")).await;
    assert!(endpoint.delivered().is_empty());

    tokio::time::advance(Duration::from_millis(700)).await;
    let sent = adapter.send(Payload::new("c")).await;
    assert!(matches!(sent.payload(), Some(SendOutcome::Delivered(_))));

    let deliveries = endpoint.delivered();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].items.len(), 3);
    assert_eq!(deliveries[0].trigger, Some(FlushTrigger::Time));
}

#[tokio::test(start_paused = true)]
async fn test_flush_if_due_waits_for_timeout() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Time,
        batch_timeout_ms: Some(500),
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();

    adapter.send(Payload::new("a")).await;
    assert!(adapter.flush_if_due().await.payload().unwrap().is_none());

    tokio::time::advance(Duration::from_millis(600)).await;
    let flushed = adapter.flush_if_due().await;
    assert!(flushed.payload().unwrap().is_some());
    assert_eq!(endpoint.delivered().len(), 1);
}

#[tokio::test]
async fn test_failed_flush_drops_batch_by_default() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Size,
        batch_size: Some(2),
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();
    endpoint.failing_deliveries.store(1, Ordering::SeqCst);

    adapter.send(Payload::new("a")).await;
    let result = adapter.send(Payload::new("b")).await;

    assert!(!result.is_success());
    assert_eq!(meta(&result, "droppedCount"), Some(2));
    assert_eq!(adapter.buffered_items(), 0);
}

#[tokio::test]
async fn test_failed_flush_requeues_batch() {
    let config = AdapterConfig {
        batch_strategy: BatchStrategy::Size,
        batch_size: Some(2),
        flush_failure_policy: FlushFailurePolicy::Requeue,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();
    endpoint.failing_deliveries.store(1, Ordering::SeqCst);

    adapter.send(Payload::new("a")).await;
    let result = adapter.send(Payload::new("b")).await;
    assert!(!result.is_success());
    assert_eq!(meta(&result, "requeuedCount"), Some(2));
    assert_eq!(adapter.buffered_items(), 2);

    let flushed = adapter.flush().await;
    assert!(flushed.is_success());
    let deliveries = endpoint.delivered();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(&deliveries[0].items[0].content[..], b"a");
    assert_eq!(&deliveries[0].items[1].content[..], b"b");
    assert_eq!(deliveries[0].trigger, Some(FlushTrigger::Manual));
}

#[tokio::test]
async fn test_send_batch_reports_partial_success() {
    let config = AdapterConfig {
        continue_on_error: true,
        ..Default::default()
    };
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, config);
    adapter.initialize().await.unwrap();
    endpoint.failing_deliveries.store(1, Ordering::SeqCst);

    let payloads = vec![Payload::new("a"), Payload::new("b"), Payload::new("c")];
    let result = adapter.send_batch(payloads).await;

    assert_eq!(result.kind(), OutcomeKind::PartialSuccess);
    assert_eq!(meta(&result, "successCount"), Some(2));
    assert_eq!(meta(&result, "failureCount"), Some(1));
    assert_eq!(meta(&result, "totalCount"), Some(3));
    assert_eq!(result.payload().unwrap().len(), 2);
}

#[tokio::test]
async fn test_send_batch_stops_at_first_failure() {
    let (adapter, endpoint) = adapter(AdapterMode::Receiver, AdapterConfig::default());
    adapter.initialize().await.unwrap();
    endpoint.failing_deliveries.store(1, Ordering::SeqCst);

    let result = adapter
        .send_batch(vec![Payload::new("a"), Payload::new("b")])
        .await;

    assert_eq!(result.kind(), OutcomeKind::Failure);
    assert_eq!(meta(&result, "successCount"), Some(0));
    assert!(endpoint.delivered().is_empty());
}
