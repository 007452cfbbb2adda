//! In-memory exclusive-checkout pool over pre-generated vanity keys.
//!
//! Every mutation runs under one mutex so two callers can never observe the
//! same record as available. Nothing here blocks waiting for a key: an empty
//! pool answers `PoolError::Exhausted` immediately.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{KeyRecord, KeyStatus, PoolStats};

use super::snapshot::KeySource;

/// Pool errors, returned as values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No available key right now. Expected under load.
    #[error("No available vanity mint keys")]
    Exhausted,

    /// Confirm or release on a key that is not checked out
    #[error("Key {public_key} is not pending: {reason}")]
    StateConflict { public_key: String, reason: String },

    /// The pool has been shut down
    #[error("Key pool is shut down")]
    Closed,
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Tracked records (available and pending); used records are evicted
    records: Vec<KeyRecord>,

    /// Pending index keyed by public key
    pending: HashSet<String>,

    /// Running count of confirmed keys
    used: usize,

    closed: bool,
}

impl PoolInner {
    fn position(&self, public_key: &str) -> Option<usize> {
        self.records.iter().position(|r| r.public_key == public_key)
    }

    fn is_candidate(&self, record: &KeyRecord) -> bool {
        record.status == KeyStatus::Available && !self.pending.contains(&record.public_key)
    }

    fn conflict(&self, public_key: &str) -> PoolError {
        let reason = if self.position(public_key).is_some() {
            "key is not checked out"
        } else {
            "key is unknown or already used"
        };
        PoolError::StateConflict {
            public_key: public_key.to_string(),
            reason: reason.to_string(),
        }
    }

    fn stats(&self) -> PoolStats {
        let available = self.records.iter().filter(|r| self.is_candidate(r)).count();
        PoolStats {
            total: self.records.len(),
            available,
            pending: self.pending.len(),
            used: self.used,
        }
    }
}

/// Exclusive-checkout vanity key pool
#[derive(Debug, Default)]
pub struct KeyPool {
    inner: Mutex<PoolInner>,
}

impl KeyPool {
    /// Create an empty, open pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool and load it from `source`
    pub fn from_source(source: &dyn KeySource) -> Result<Self> {
        let pool = Self::new();
        pool.load(source)?;
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A poisoned lock only means another holder panicked mid-call.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the tracked set with the contents of `source`.
    ///
    /// Every record starts `Available`. Duplicate public keys are skipped.
    /// Returns the number of records loaded.
    pub fn load(&self, source: &dyn KeySource) -> Result<usize> {
        let seeds = source.load()?;

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(seeds.len());
        for seed in seeds {
            if !seen.insert(seed.public_key.clone()) {
                warn!(public_key = %seed.public_key, "Skipping duplicate vanity key");
                continue;
            }
            records.push(KeyRecord::from_seed(seed));
        }

        let count = records.len();
        let mut inner = self.lock();
        *inner = PoolInner {
            records,
            ..PoolInner::default()
        };

        info!(count, "Loaded vanity keys into memory");
        Ok(count)
    }

    /// Check out a uniformly random available key and mark it pending
    pub fn checkout(&self) -> Result<KeyRecord, PoolError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(PoolError::Closed);
        }

        inner.records.shuffle(&mut rand::rng());

        let Some(idx) = inner.records.iter().position(|r| inner.is_candidate(r)) else {
            debug!("No available vanity keys");
            return Err(PoolError::Exhausted);
        };

        let public_key = inner.records[idx].public_key.clone();
        inner.records[idx].status = KeyStatus::Pending;
        inner.pending.insert(public_key.clone());

        info!(%public_key, "Checked out vanity key (now pending)");
        Ok(inner.records[idx].clone())
    }

    /// Mark a pending key used and evict it from the pool for good
    pub fn confirm(&self, public_key: &str) -> Result<KeyRecord, PoolError> {
        let mut inner = self.lock();

        if !inner.pending.contains(public_key) {
            let err = inner.conflict(public_key);
            warn!(%public_key, error = %err, "Rejected confirm");
            return Err(err);
        }

        let Some(idx) = inner.position(public_key) else {
            // Pending index and tracked set disagree; drop the stale entry.
            inner.pending.remove(public_key);
            return Err(inner.conflict(public_key));
        };

        inner.pending.remove(public_key);
        let mut record = inner.records.swap_remove(idx);
        record.status = KeyStatus::Used;
        record.used_at = Some(Utc::now());
        inner.used += 1;

        info!(%public_key, "Confirmed vanity key (removed from pool)");
        Ok(record)
    }

    /// Return a pending key to the pool
    pub fn release(&self, public_key: &str) -> Result<(), PoolError> {
        let mut inner = self.lock();

        if !inner.pending.remove(public_key) {
            let err = inner.conflict(public_key);
            warn!(%public_key, error = %err, "Rejected release");
            return Err(err);
        }

        if let Some(idx) = inner.position(public_key) {
            inner.records[idx].status = KeyStatus::Available;
        }

        info!(%public_key, "Released vanity key (returned to pool)");
        Ok(())
    }

    /// Live counts
    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    /// Public keys currently checked out
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().pending.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Public keys currently available for checkout
    pub fn available_keys(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .records
            .iter()
            .filter(|r| inner.is_candidate(r))
            .map(|r| r.public_key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the pool; later checkouts fail with `PoolError::Closed`.
    ///
    /// Keys still pending at this point were never confirmed or released
    /// and are logged as leaked.
    pub fn shutdown(&self) -> PoolStats {
        let mut inner = self.lock();
        inner.closed = true;

        for public_key in &inner.pending {
            warn!(%public_key, "Vanity key still pending at shutdown");
        }

        let stats = inner.stats();
        info!(
            total = stats.total,
            pending = stats.pending,
            used = stats.used,
            "Key pool shut down"
        );
        stats
    }
}
