//! Vanity key records held by the pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a key record.
///
/// `Used` is terminal: confirmed records leave the pool and are never
/// observed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Free for checkout
    Available,

    /// Checked out, awaiting confirm or release
    Pending,

    /// Confirmed and evicted from the pool
    Used,
}

impl Default for KeyStatus {
    fn default() -> Self {
        Self::Available
    }
}

/// A key pair as it appears in the on-disk snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySeed {
    pub public_key: String,
    pub secret_key: String,
}

impl KeySeed {
    pub fn new(public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

/// A pre-generated key pair tracked by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    /// Identity of the record, unique across everything ever loaded
    pub public_key: String,

    pub secret_key: String,

    pub status: KeyStatus,

    /// When the record was loaded into this process
    pub created_at: DateTime<Utc>,

    /// Set on confirm
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    /// Build a fresh record from a snapshot seed.
    ///
    /// Every loaded record starts out `Available`; whatever state the key had
    /// before the last shutdown is not carried over.
    pub fn from_seed(seed: KeySeed) -> Self {
        Self {
            public_key: seed.public_key,
            secret_key: seed.secret_key,
            status: KeyStatus::Available,
            created_at: Utc::now(),
            used_at: None,
        }
    }
}

/// Point-in-time pool counts.
///
/// `total` counts tracked records (available + pending); `used` is a running
/// counter because used records are evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub pending: usize,
    pub used: usize,
}
