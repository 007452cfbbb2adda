//! Domain types for launchkit.
//!
//! This module contains the core data structures:
//! - Key: vanity key records and pool counts
//! - Launch: the launch aggregate and its state machine
//! - Worker: external worker invocations and results

pub mod key;
pub mod launch;
pub mod worker;

// Re-export commonly used types
pub use key::{KeyRecord, KeySeed, KeyStatus, PoolStats};
pub use launch::{
    BundleOutcome, DependentBatch, DependentWallet, LaunchAggregate, LaunchState, TokenMetadata,
};
pub use worker::{WorkerCommand, WorkerInvocation, WorkerResult};
