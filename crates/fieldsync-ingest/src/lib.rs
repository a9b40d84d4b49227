//! Fieldsync telemetry reconciliation engine.
//!
//! Merges a bounded historical query and a live MQTT subscription for one
//! device into a single append-only, deduplicated record store.
//!
//! # Modules
//!
//! - [`store`] - Durable record list, rewritten atomically
//! - [`dedupe`] - In-memory natural-key index rebuilt from the store
//! - [`source`] - Envelope sources (historical HTTP query, live MQTT)
//! - [`reconcile`] - The loop that drives both phases
//! - [`events`] - Structured events emitted by the loop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────┐
//! │ HistoricalFetcher│      │   LiveIngestor   │
//! │  (backfill once) │      │ (per message)    │
//! └────────┬─────────┘      └────────┬─────────┘
//!          │                         │
//!          └───────────┬─────────────┘
//!                      ▼
//!          ┌──────────────────────┐
//!          │  ReconciliationLoop  │──▶ EventSink (logs, metrics)
//!          └──────────┬───────────┘
//!                     │
//!          ┌──────────┴───────────┐
//!          ▼                      ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │   DedupeIndex   │    │   RecordStore   │  JSON array on disk
//! └─────────────────┘    └─────────────────┘
//! ```
//!
//! The store file is the source of truth; the index is derived from it at
//! startup and never persisted.

pub mod dedupe;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod source;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use dedupe::{DedupeIndex, DedupeStats};
pub use events::{EventSink, IngestEvent, MemorySink, Phase, TracingSink};
pub use reconcile::{ReconciliationLoop, RunSummary};
pub use store::RecordStore;

// Re-export source trait and adapters
pub use source::{
    EnvelopeSource, HistoricalConfig, HistoricalFetcher, LiveConfig, LiveIngestor, SourceItem,
    SourceStats,
};
