//! Batch accumulator for outbound payloads
//!
//! Not synchronized on its own: the runtime keeps it behind the adapter's
//! state lock, so `push` and `take` never interleave.

use crate::{
    config::{AdapterConfig, BatchStrategy},
    types::FlushTrigger,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Snapshot handed to the sink as one indivisible unit
#[derive(Debug, Clone, PartialEq)]
pub struct BatchUnit<T> {
    /// Monotonically increasing sequence number (starts at 1)
    pub sequence: u64,
    /// Items in insertion order
    pub items: Vec<T>,
    /// Why the unit was cut
    pub trigger: FlushTrigger,
}

/// Ordered buffer with size/time flush conditions
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    strategy: BatchStrategy,
    batch_size: Option<usize>,
    batch_timeout: Option<Duration>,
    buffer: Vec<T>,
    last_flush: Instant,
    sequence: u64,
}

impl<T> BatchAccumulator<T> {
    /// Create an accumulator
    pub fn new(strategy: BatchStrategy, batch_size: Option<usize>, batch_timeout: Option<Duration>) -> Self {
        Self {
            strategy,
            batch_size,
            batch_timeout,
            buffer: Vec::new(),
            last_flush: Instant::now(),
            sequence: 0,
        }
    }

    /// Create from adapter configuration
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self::new(
            config.batch_strategy,
            config.batch_size,
            config.batch_timeout_ms.map(Duration::from_millis),
        )
    }

    /// Buffered items
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Sequence number of the last unit cut
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Append an item and cut a unit if a flush condition holds
    pub fn push(&mut self, item: T) -> Option<BatchUnit<T>> {
        self.push_at(item, Instant::now())
    }

    /// [`push`](Self::push) at an explicit instant
    pub fn push_at(&mut self, item: T, now: Instant) -> Option<BatchUnit<T>> {
        self.buffer.push(item);
        let trigger = self.due_at(now)?;
        self.take_at(trigger, now)
    }

    /// Flush condition currently holding, if any
    pub fn due(&self) -> Option<FlushTrigger> {
        self.due_at(Instant::now())
    }

    /// [`due`](Self::due) at an explicit instant
    pub fn due_at(&self, now: Instant) -> Option<FlushTrigger> {
        if self.buffer.is_empty() {
            return None;
        }

        if self.strategy.uses_size() {
            if let Some(size) = self.batch_size {
                if self.buffer.len() >= size {
                    return Some(FlushTrigger::Size);
                }
            }
        }

        if self.strategy.uses_time() {
            if let Some(timeout) = self.batch_timeout {
                if now.saturating_duration_since(self.last_flush) >= timeout {
                    return Some(FlushTrigger::Time);
                }
            }
        }

        None
    }

    /// Snapshot and clear the buffer; `None` when empty
    pub fn take(&mut self, trigger: FlushTrigger) -> Option<BatchUnit<T>> {
        self.take_at(trigger, Instant::now())
    }

    fn take_at(&mut self, trigger: FlushTrigger, now: Instant) -> Option<BatchUnit<T>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.sequence += 1;
        self.last_flush = now;
        let items = std::mem::take(&mut self.buffer);
        debug!(
            "Cut batch #{} with {} items ({})",
            self.sequence,
            items.len(),
            trigger.as_str()
        );
        Some(BatchUnit {
            sequence: self.sequence,
            items,
            trigger,
        })
    }

    /// Put a failed snapshot back in front of newer items
    pub fn requeue(&mut self, mut items: Vec<T>) {
        items.append(&mut self.buffer);
        self.buffer = items;
    }

    /// Drop everything buffered, returning the count
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
