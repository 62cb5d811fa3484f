//! Adapter metrics

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

lazy_static::lazy_static! {
    pub static ref ADAPTER_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "adapter_operations_total",
        "Total adapter operations",
        &["adapter_type", "operation", "outcome"]
    )
    .unwrap();

    pub static ref ADAPTER_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "adapter_operation_duration_seconds",
        "Adapter operation duration",
        &["adapter_type", "operation"]
    )
    .unwrap();

    pub static ref SESSIONS_OPEN: IntGaugeVec = register_int_gauge_vec!(
        "adapter_sessions_open",
        "Open protocol sessions per adapter",
        &["adapter_id"]
    )
    .unwrap();

    pub static ref BATCH_FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "adapter_batch_flushes_total",
        "Batch flushes by trigger and outcome",
        &["adapter_type", "trigger", "outcome"]
    )
    .unwrap();

    pub static ref DUPLICATES_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "adapter_duplicates_skipped_total",
        "Items dropped by the duplicate filter",
        &["adapter_type"]
    )
    .unwrap();

    pub static ref BUFFERED_ITEMS: IntGaugeVec = register_int_gauge_vec!(
        "adapter_buffered_items",
        "Items waiting in the batch buffer",
        &["adapter_id"]
    )
    .unwrap();
}
