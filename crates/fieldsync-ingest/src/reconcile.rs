//! The reconciliation loop.
//!
//! # Phases
//!
//! ```text
//! ┌──────────────┐   once, then never again   ┌──────────────┐
//! │   Backfill   │ ─────────────────────────▶ │     Live     │ ──▶ until cancelled
//! │ fetch window │                            │ per message  │
//! │ persist once │                            │ persist each │
//! └──────────────┘                            └──────────────┘
//! ```
//!
//! Every candidate goes through the same check: build a record, compute its
//! natural key, reject it if the key is already indexed, otherwise append it
//! to the store and index the key. Keyless records are always admitted.
//!
//! The loop is the single owner of the store and the index. Sources call the
//! handler sequentially, so no locking is involved.
//!
//! # Failure Policy
//!
//! - Historical transport failure: logged as `FetchFailed`, backfill admits
//!   nothing, live still runs.
//! - Persist failure: the unpersisted appends are rolled back out of memory
//!   and index, and the error halts ingestion.
//! - Subscription loss: reported and returned; the caller exits.

use crate::dedupe::DedupeIndex;
use crate::error::{Error, Result};
use crate::events::{EventSink, IngestEvent, Phase};
use crate::source::{EnvelopeSource, SourceItem, SourceStats};
use crate::store::RecordStore;
use chrono::Utc;
use fieldsync_core::{NaturalKey, TelemetryRecord};
use std::path::Path;
use tracing::{debug, info};

/// Counters for one process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records in the store file at startup.
    pub loaded: usize,

    /// Well-formed envelopes returned by the historical query.
    pub backfill_fetched: usize,
    pub backfill_admitted: usize,
    pub backfill_duplicates: usize,

    /// Whether the historical query failed at the transport level.
    pub fetch_failed: bool,

    /// Well-formed messages received over the live subscription.
    pub live_received: usize,
    pub live_admitted: usize,
    pub live_duplicates: usize,

    /// Admitted records that carried no receipt timestamp.
    pub unkeyed_admitted: usize,

    /// Lines or messages dropped as malformed.
    pub parse_errors: usize,

    /// Records on disk as of the last successful persist.
    pub final_count: usize,
}

/// A candidate that passed the duplicate check and is now in memory.
struct Admitted {
    key: Option<NaturalKey>,
    device_id: String,
    readings: String,
}

enum Admission {
    Admitted(Admitted),
    Duplicate,
    Malformed,
}

/// Drives backfill and live ingestion into one deduplicated store.
pub struct ReconciliationLoop<S> {
    store: RecordStore,
    index: DedupeIndex,
    sink: S,
    summary: RunSummary,
}

impl<S: EventSink + Send> ReconciliationLoop<S> {
    /// Wrap a loaded store, building the dedupe index from its records.
    pub fn new(store: RecordStore, sink: S) -> Self {
        let index = DedupeIndex::build(store.records());
        let summary = RunSummary {
            loaded: store.len(),
            final_count: store.persisted_len(),
            ..Default::default()
        };
        Self {
            store,
            index,
            sink,
            summary,
        }
    }

    /// Load the store at `path` and build the loop around it.
    ///
    /// Fails with [`Error::CorruptState`] if the file exists but cannot be
    /// parsed; the caller must not ingest in that case.
    pub fn open<P: AsRef<Path>>(path: P, sink: S) -> Result<Self> {
        let store = RecordStore::load(path)?;
        Ok(Self::new(store, sink))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn index(&self) -> &DedupeIndex {
        &self.index
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn into_store(self) -> RecordStore {
        self.store
    }

    /// Run both phases: backfill (if a historical source is given), then live
    /// until the live source returns, then a final persist.
    pub async fn run<H, L>(&mut self, historical: Option<&mut H>, live: &mut L) -> Result<RunSummary>
    where
        H: EnvelopeSource,
        L: EnvelopeSource,
    {
        if let Some(historical) = historical {
            self.backfill(historical).await?;
        }

        info!(
            records = self.store.len(),
            "Starting live collection"
        );
        let live_result = self.run_live(live).await;
        let finished = self.finish();

        live_result?;
        finished
    }

    /// Backfill phase: drain the historical source once, persist once.
    ///
    /// Returns the number of records admitted. A transport failure is not an
    /// error here; it is reported and treated as an empty response.
    pub async fn backfill<H>(&mut self, source: &mut H) -> Result<usize>
    where
        H: EnvelopeSource,
    {
        let phase = Phase::Backfill;
        let start_len = self.store.len();
        let mut pending: Vec<Admitted> = Vec::new();
        let mut fetched = 0usize;
        let mut duplicates = 0usize;
        let mut malformed = 0usize;

        info!(source = source.name(), "Fetching historical data");

        let result = source
            .process(|item| {
                if matches!(item, SourceItem::Envelope(_)) {
                    fetched += 1;
                }
                match self.reconcile(phase, item) {
                    Admission::Admitted(admitted) => pending.push(admitted),
                    Admission::Duplicate => duplicates += 1,
                    Admission::Malformed => malformed += 1,
                }
                Ok(true)
            })
            .await;

        match result {
            Ok(stats) => debug!(?stats, "Historical source drained"),
            Err(Error::Transport(reason)) => {
                self.summary.fetch_failed = true;
                self.sink.emit(IngestEvent::FetchFailed { reason });
            }
            Err(e) => {
                self.discard(start_len, &pending);
                return Err(e);
            }
        }

        let admitted = pending.len();
        if admitted > 0
            && let Err(e) = self.persist(phase)
        {
            self.discard(start_len, &pending);
            return Err(e);
        }

        // Admissions are reported only once they are on disk.
        let unkeyed = pending.iter().filter(|a| a.key.is_none()).count();
        for (offset, admitted) in pending.into_iter().enumerate() {
            self.emit_admitted(phase, admitted, start_len + offset + 1);
        }

        self.summary.backfill_fetched += fetched;
        self.summary.backfill_admitted += admitted;
        self.summary.backfill_duplicates += duplicates;
        self.summary.unkeyed_admitted += unkeyed;
        self.summary.parse_errors += malformed;
        self.summary.final_count = self.store.persisted_len();

        self.sink.emit(IngestEvent::BackfillCompleted {
            fetched,
            admitted,
            duplicates,
        });

        Ok(admitted)
    }

    /// Live phase: admit and persist each message as it arrives.
    pub async fn run_live<L>(&mut self, source: &mut L) -> Result<SourceStats>
    where
        L: EnvelopeSource,
    {
        info!(source = source.name(), "Waiting for real-time messages");

        let result = source.process(|item| self.admit_live(item)).await;

        if let Err(Error::Subscription(reason)) = &result {
            self.sink.emit(IngestEvent::SubscriptionLost {
                reason: reason.clone(),
            });
        }
        result
    }

    /// Persist anything still only in memory and return the run summary.
    pub fn finish(&mut self) -> Result<RunSummary> {
        if self.store.is_dirty() {
            self.persist(Phase::Live)?;
        }
        self.summary.final_count = self.store.persisted_len();
        Ok(self.summary.clone())
    }

    fn admit_live(&mut self, item: SourceItem) -> Result<bool> {
        let phase = Phase::Live;
        if matches!(item, SourceItem::Envelope(_)) {
            self.summary.live_received += 1;
        }

        match self.reconcile(phase, item) {
            Admission::Admitted(admitted) => {
                let previous_len = self.store.len() - 1;
                if let Err(e) = self.persist(phase) {
                    self.store.rollback(previous_len);
                    if let Some(key) = &admitted.key {
                        self.index.remove(key);
                    }
                    return Err(e);
                }

                self.summary.live_admitted += 1;
                if admitted.key.is_none() {
                    self.summary.unkeyed_admitted += 1;
                }
                self.summary.final_count = self.store.persisted_len();
                let store_size = self.store.len();
                self.emit_admitted(phase, admitted, store_size);
            }
            Admission::Duplicate => self.summary.live_duplicates += 1,
            Admission::Malformed => self.summary.parse_errors += 1,
        }

        Ok(true)
    }

    /// The duplicate check shared by both phases.
    fn reconcile(&mut self, phase: Phase, item: SourceItem) -> Admission {
        let envelope = match item {
            SourceItem::Envelope(envelope) => envelope,
            SourceItem::Malformed { reason } => {
                self.sink.emit(IngestEvent::ParseFailed { phase, reason });
                return Admission::Malformed;
            }
        };

        let record = TelemetryRecord::from_envelope(&envelope, Utc::now());
        let key = record.natural_key();

        if let Some(key) = &key
            && !self.index.check_and_insert(key)
        {
            self.sink.emit(IngestEvent::DuplicateRejected {
                phase,
                key: key.clone(),
            });
            return Admission::Duplicate;
        }

        let admitted = Admitted {
            key,
            device_id: record.device_id.clone(),
            readings: record.reading_summary(),
        };
        self.store.append([record]);
        Admission::Admitted(admitted)
    }

    /// Undo in-memory appends made since `start_len`.
    fn discard(&mut self, start_len: usize, pending: &[Admitted]) {
        self.store.rollback(start_len);
        for key in pending.iter().filter_map(|a| a.key.as_ref()) {
            self.index.remove(key);
        }
    }

    fn emit_admitted(&mut self, phase: Phase, admitted: Admitted, store_size: usize) {
        self.sink.emit(IngestEvent::RecordAdmitted {
            phase,
            device_id: admitted.device_id,
            key: admitted.key,
            store_size,
            readings: admitted.readings,
        });
    }

    fn persist(&mut self, phase: Phase) -> Result<()> {
        match self.store.persist() {
            Ok(()) => {
                self.sink.emit(IngestEvent::Persisted {
                    phase,
                    records: self.store.len(),
                });
                Ok(())
            }
            Err(e) => {
                self.sink.emit(IngestEvent::PersistFailed {
                    phase,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}
