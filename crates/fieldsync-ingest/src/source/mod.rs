//! Envelope source adapters.
//!
//! # Available Sources
//!
//! - [`HistoricalFetcher`] - One bounded query against the storage API (backfill)
//! - [`LiveIngestor`] - MQTT subscription to the device uplink topic (live)
//!
//! # Architecture
//!
//! Both sources implement [`EnvelopeSource`], so the reconciliation loop
//! drives them the same way: it passes a handler that receives one
//! [`SourceItem`] at a time, in arrival order, never concurrently.

mod historical;
mod live;

pub use historical::{
    DEFAULT_FETCH_TIMEOUT, HistoricalConfig, HistoricalFetcher, ParsedStream, format_window,
    parse_stream, parse_window,
};
pub use live::{LiveConfig, LiveIngestor, decode_publish, parse_broker_url, uplink_topic};

use crate::Result;
use async_trait::async_trait;
use fieldsync_core::RawEnvelope;

/// One unit delivered by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    /// A well-formed envelope.
    Envelope(RawEnvelope),

    /// Input that could not be parsed. Reported so it can be logged and
    /// counted; it carries nothing to admit.
    Malformed { reason: String },
}

/// A source of telemetry envelopes.
#[async_trait]
pub trait EnvelopeSource: Send {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Deliver items from this source to `handler`.
    ///
    /// The handler returns `Ok(true)` to continue, `Ok(false)` to stop
    /// gracefully, or `Err` to abort; the error is returned unchanged.
    ///
    /// Transport-level failures are returned as [`Error::Transport`] for the
    /// pull source and [`Error::Subscription`] for the push source.
    ///
    /// [`Error::Transport`]: crate::Error::Transport
    /// [`Error::Subscription`]: crate::Error::Subscription
    async fn process<F>(&mut self, handler: F) -> Result<SourceStats>
    where
        F: FnMut(SourceItem) -> Result<bool> + Send;
}

/// Statistics from processing a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Items handed to the handler.
    pub total_items: usize,

    /// Items that were well-formed envelopes.
    pub valid_envelopes: usize,

    /// Items that failed to parse.
    pub parse_errors: usize,

    /// Lines or packets ignored without error (keepalives, control lines).
    pub skipped: usize,
}
