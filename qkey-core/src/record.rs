// SPDX-License-Identifier: MIT
//
// QKey Dispenser: Quantum Key Provisioning Service
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara
//
// https://github.com/vbocan/qrng-data-diode

//! Issued key records and the table of previously served keys

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A key token tagged with the identifier it was issued under
///
/// Records are only built by the context's dispense path and never change
/// afterwards. Two records are equal when their identifiers are equal; the
/// same token may appear under several identifiers when the buffer ran dry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    id: u64,
    token: String,
    issued_at: DateTime<Utc>,
}

impl KeyRecord {
    pub(crate) fn new(id: u64, token: String) -> Self {
        Self {
            id,
            token,
            issued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The opaque key material, exactly as read from the source line
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn into_token(self) -> String {
        self.token
    }
}

impl PartialEq for KeyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KeyRecord {}

/// Eviction policy for the served-key table
///
/// Both limits are optional; with neither set the table keeps every record
/// until the context stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many records, dropping the lowest ids first
    pub max_records: Option<usize>,
    /// Drop records older than this
    pub ttl_secs: Option<u64>,
}

/// Longest accepted record TTL (100 years)
pub const MAX_RETENTION_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_records.is_none() && self.ttl_secs.is_none()
    }

    /// TTL as a signed duration; `None` when unset or not representable
    fn ttl(&self) -> Option<Duration> {
        let secs = i64::try_from(self.ttl_secs?).ok()?;
        Duration::try_seconds(secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub inserted: u64,
    pub evictions_capacity: u64,
    pub evictions_ttl: u64,
}

/// Identifier-indexed table of dispensed records
///
/// Identifiers are inserted in increasing order, so the first entry is
/// always the oldest one.
#[derive(Debug, Default)]
pub struct RecordTable {
    entries: BTreeMap<u64, KeyRecord>,
    policy: RetentionPolicy,
    stats: TableStats,
}

impl RecordTable {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
            stats: TableStats::default(),
        }
    }

    /// Store a freshly dispensed record, applying the retention policy
    pub fn insert(&mut self, record: KeyRecord) {
        if let Some(ttl) = self.policy.ttl() {
            self.evict_stale(ttl);
        }

        self.entries.insert(record.id, record);
        self.stats.inserted += 1;

        if let Some(max) = self.policy.max_records {
            while self.entries.len() > max {
                if self.entries.pop_first().is_some() {
                    self.stats.evictions_capacity += 1;
                }
            }
        }
    }

    /// Look up a record; negative, unknown, evicted and expired ids all miss
    pub fn get(&self, id: i64) -> Option<KeyRecord> {
        let id = u64::try_from(id).ok()?;
        let record = self.entries.get(&id)?;

        if let Some(ttl) = self.policy.ttl() {
            if Utc::now().signed_duration_since(record.issued_at) > ttl {
                return None;
            }
        }

        Some(record.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> TableStats {
        self.stats.clone()
    }

    fn evict_stale(&mut self, ttl: Duration) {
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return;
        };

        while let Some(entry) = self.entries.first_entry() {
            if entry.get().issued_at < cutoff {
                entry.remove();
                self.stats.evictions_ttl += 1;
            } else {
                break;
            }
        }
    }
}
