//! In-memory deduplication index keyed by natural key.
//!
//! The index is derived state: it is rebuilt from the record store on every
//! start by a single O(n) scan and never persisted. Records whose envelope
//! lacks a receipt timestamp have no key; they are counted, logged, and can
//! never be recognised as duplicates.

use fieldsync_core::{NaturalKey, TelemetryRecord};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Set of natural keys already present in the store.
#[derive(Debug, Default)]
pub struct DedupeIndex {
    keys: HashSet<NaturalKey>,
    unkeyed_records: usize,
    duplicate_records: usize,
}

impl DedupeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index from the store's records.
    pub fn build<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a TelemetryRecord>,
    {
        let mut index = Self::new();
        let mut scanned = 0usize;

        for (position, record) in records.into_iter().enumerate() {
            scanned += 1;
            match record.natural_key() {
                Some(key) => {
                    if !index.keys.insert(key) {
                        index.duplicate_records += 1;
                    }
                }
                None => {
                    debug!(
                        position,
                        device_id = %record.device_id,
                        "stored record has no receipt timestamp, cannot deduplicate"
                    );
                    index.unkeyed_records += 1;
                }
            }
        }

        if index.unkeyed_records > 0 {
            warn!(
                unkeyed = index.unkeyed_records,
                "stored records without a receipt timestamp are treated as always-novel"
            );
        }
        if index.duplicate_records > 0 {
            warn!(
                duplicates = index.duplicate_records,
                "record file already contains records sharing a natural key"
            );
        }
        info!(
            scanned,
            keys = index.keys.len(),
            "Dedupe index built"
        );

        index
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.keys.contains(key)
    }

    /// Insert a key. Idempotent; returns `true` if the key was new.
    pub fn insert(&mut self, key: NaturalKey) -> bool {
        self.keys.insert(key)
    }

    /// Check a key and record it in one step.
    ///
    /// Returns `true` if the key was new. This is the main API during
    /// reconciliation.
    pub fn check_and_insert(&mut self, key: &NaturalKey) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.clone())
    }

    /// Forget a key whose record was rolled back.
    pub fn remove(&mut self, key: &NaturalKey) -> bool {
        self.keys.remove(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn stats(&self) -> DedupeStats {
        DedupeStats {
            keys: self.keys.len(),
            unkeyed_records: self.unkeyed_records,
            duplicate_records: self.duplicate_records,
        }
    }
}

/// Statistics about the dedupe index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupeStats {
    /// Distinct natural keys.
    pub keys: usize,

    /// Stored records scanned at build time that had no key.
    pub unkeyed_records: usize,

    /// Stored records scanned at build time whose key was already seen.
    pub duplicate_records: usize,
}
