//! Structured ingestion events.
//!
//! The reconciliation loop reports what it does as [`IngestEvent`] values
//! sent to an [`EventSink`]. The daemon uses [`TracingSink`], which logs each
//! event and updates Prometheus counters; tests use [`MemorySink`] and assert
//! on the collected sequence.

use fieldsync_core::NaturalKey;
use fieldsync_core::metrics::{increment, set_gauge};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Phase of the reconciliation loop an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Backfill,
    Live,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the loop did or observed.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// A candidate was appended to the store.
    ///
    /// `key` is `None` when the envelope had no receipt timestamp.
    RecordAdmitted {
        phase: Phase,
        device_id: String,
        key: Option<NaturalKey>,
        store_size: usize,
        readings: String,
    },

    /// A candidate's natural key was already present.
    DuplicateRejected { phase: Phase, key: NaturalKey },

    /// A line or message could not be parsed and was dropped.
    ParseFailed { phase: Phase, reason: String },

    /// The historical query failed; backfill continues with zero records.
    FetchFailed { reason: String },

    /// Backfill finished.
    BackfillCompleted {
        fetched: usize,
        admitted: usize,
        duplicates: usize,
    },

    /// The store was rewritten.
    Persisted { phase: Phase, records: usize },

    /// A store rewrite failed.
    PersistFailed { phase: Phase, reason: String },

    /// The live subscription ended with an error.
    SubscriptionLost { reason: String },
}

/// Receiver of [`IngestEvent`]s.
pub trait EventSink {
    fn emit(&mut self, event: IngestEvent);
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn emit(&mut self, event: IngestEvent) {
        (**self).emit(event);
    }
}

/// Logs events with `tracing` and records metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: IngestEvent) {
        match event {
            IngestEvent::RecordAdmitted {
                phase,
                device_id,
                key,
                store_size,
                readings,
            } => {
                match &key {
                    Some(key) => tracing::info!(
                        phase = %phase,
                        device_id = %device_id,
                        received_at = %key.received_at,
                        "Added record #{}",
                        store_size
                    ),
                    None => tracing::warn!(
                        phase = %phase,
                        device_id = %device_id,
                        "Added record #{} without receipt timestamp; it cannot be deduplicated",
                        store_size
                    ),
                }
                tracing::debug!(device_id = %device_id, "readings: {}", readings);
                metrics::counter!("reconcile_records_admitted_total", "phase" => phase.as_str())
                    .increment(1);
                if key.is_none() {
                    metrics::counter!("reconcile_unkeyed_total", "phase" => phase.as_str())
                        .increment(1);
                }
                set_gauge("store_records", store_size as f64);
            }
            IngestEvent::DuplicateRejected { phase, key } => {
                tracing::debug!(phase = %phase, key = %key, "Record already exists, skipping");
                metrics::counter!("reconcile_duplicates_total", "phase" => phase.as_str())
                    .increment(1);
            }
            IngestEvent::ParseFailed { phase, reason } => {
                tracing::warn!(phase = %phase, "Dropping malformed input: {}", reason);
                metrics::counter!("reconcile_parse_errors_total", "phase" => phase.as_str())
                    .increment(1);
            }
            IngestEvent::FetchFailed { reason } => {
                tracing::warn!(
                    "Historical fetch failed, continuing without backfill: {}",
                    reason
                );
                increment("historical_fetch_failures_total", 1);
            }
            IngestEvent::BackfillCompleted {
                fetched,
                admitted,
                duplicates,
            } => {
                tracing::info!(
                    fetched,
                    admitted,
                    duplicates,
                    "Backfill complete"
                );
            }
            IngestEvent::Persisted { phase, records } => {
                tracing::debug!(phase = %phase, records, "Store persisted");
                increment("store_persist_total", 1);
            }
            IngestEvent::PersistFailed { phase, reason } => {
                tracing::error!(phase = %phase, "Failed to persist store: {}", reason);
                increment("store_persist_failures_total", 1);
            }
            IngestEvent::SubscriptionLost { reason } => {
                tracing::error!("Live subscription lost: {}", reason);
                increment("live_subscription_errors_total", 1);
            }
        }
    }
}

/// Collects events in memory.
///
/// Clones share the same buffer, so a test can keep one handle and give the
/// other to the loop.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<IngestEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<IngestEvent> {
        self.events.lock().clone()
    }

    /// Number of collected events matching `pred`.
    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&IngestEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&mut self, event: IngestEvent) {
        self.events.lock().push(event);
    }
}
