//! High-reliability admission filter.
//!
//! With high reliability enabled, a new version only becomes visible after
//! `threshold + 1` consecutive finalized transactions for the same
//! `(guid, hash)` carried an identical manifest and byte-identical payloads.
//! Once admitted the version is locked and later uploads are dropped.

use std::collections::HashMap;

use vcache_types::{FileKind, VersionKey};

use crate::transaction::PayloadDigest;

/// Outcome of offering a finalized transaction to the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not enough matching observations yet; do not publish.
    Hold,
    /// The observation crossed the threshold; publish and lock.
    Admit,
    /// The version is already locked; drop the transaction.
    AlreadyLocked,
}

#[derive(Debug, Clone)]
struct ReliabilityRecord {
    /// Manifest and per-kind payload digests of the last observation,
    /// sorted by kind so comparison is order-independent.
    digests: Vec<(FileKind, PayloadDigest)>,
    match_count: u32,
    locked: bool,
}

/// Per-version tally of consecutive matching uploads.
#[derive(Debug)]
pub struct ReliabilityFilter {
    threshold: u32,
    records: HashMap<VersionKey, ReliabilityRecord>,
}

impl ReliabilityFilter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            records: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Change the threshold for versions not yet locked.
    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    /// Whether a version has been admitted and is immutable.
    pub fn is_locked(&self, key: &VersionKey) -> bool {
        self.records.get(key).is_some_and(|r| r.locked)
    }

    /// Lock a version without counting observations.  Used when reliability
    /// is enabled on a live engine: versions already published stay visible
    /// and become immutable.
    pub fn mark_locked(&mut self, key: VersionKey) {
        self.records
            .entry(key)
            .and_modify(|r| r.locked = true)
            .or_insert(ReliabilityRecord {
                digests: Vec::new(),
                match_count: 0,
                locked: true,
            });
    }

    /// Offer one finalized transaction's manifest and payload digests.
    ///
    /// A mismatch in either the manifest set or any digest resets the
    /// consecutive-match counter to 1 with the new observation as the
    /// reference.
    pub fn observe(
        &mut self,
        key: VersionKey,
        mut digests: Vec<(FileKind, PayloadDigest)>,
    ) -> Admission {
        digests.sort_by_key(|(kind, _)| *kind);

        let record = self
            .records
            .entry(key)
            .or_insert(ReliabilityRecord {
                digests: Vec::new(),
                match_count: 0,
                locked: false,
            });

        if record.locked {
            return Admission::AlreadyLocked;
        }

        if record.match_count > 0 && record.digests == digests {
            record.match_count += 1;
        } else {
            record.digests = digests;
            record.match_count = 1;
        }

        if record.match_count > self.threshold {
            record.locked = true;
            Admission::Admit
        } else {
            Admission::Hold
        }
    }

    /// Number of versions the filter currently tracks (locked or pending).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
