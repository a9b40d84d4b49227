//! Core types and shared utilities for the fieldsync ingestion pipeline.
//!
//! This crate provides:
//! - The persisted [`TelemetryRecord`] shape and its natural key
//! - [`RawEnvelope`], the unparsed message delivered by a source
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
pub mod record;

/// Device identifier used when an envelope does not carry a usable one.
pub const UNKNOWN_DEVICE_ID: &str = "unknown";

pub use error::{Error, Result};
pub use record::{NaturalKey, Origin, RawEnvelope, TelemetryRecord};
