//! Core launch logic.
//!
//! This module contains:
//! - KeyPool: exclusive checkout of pre-generated vanity keys
//! - Snapshot: where the pool's keys come from
//! - Store: durable launch aggregates
//! - Coordinator: worker-driven launch stages

pub mod coordinator;
pub mod key_pool;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use coordinator::{
    BalanceCheck, BundleSubResult, CoordinatorSettings, CreateRequest, FundingReceipt,
    GeneratedWallet, LaunchCoordinator, LaunchError, LaunchReport, LaunchSummary,
    DEFAULT_EXPLORER_TX_URL, DEFAULT_STATUS_PATTERN,
};
pub use key_pool::{KeyPool, PoolError};
pub use snapshot::{JsonKeyFile, KeySource, StaticKeys};
pub use store::{JsonLaunchStore, LaunchStore, MemoryLaunchStore};
