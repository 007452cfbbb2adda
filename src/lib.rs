//! launchkit - vanity key pool and launch worker coordinator
//!
//! Hands out pre-generated vanity mint keys under exclusive checkout, and
//! coordinates the external worker processes that fund dependent wallets,
//! create tokens and submit bundles.
//!
//! # Architecture
//!
//! Workers are supervised through three call shapes:
//! - request/response: wait for exit, parse the output
//! - streaming early-resolve: answer on a status line, persist on exit
//! - pipeline: primary call, then an optional nested call whose failure
//!   never fails the whole request
//!
//! # Modules
//!
//! - `adapters`: Worker process supervision
//! - `core`: KeyPool, launch store and coordinator
//! - `domain`: Data structures (keys, launches, worker invocations)
//! - `api`: JSON request dispatch
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve JSON-line requests
//! launchkit serve
//!
//! # One request
//! launchkit call '{"action":"pool_stats"}'
//! ```

pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{ProcessOrchestrator, WorkerError};
pub use api::{Api, Request};
pub use core::{KeyPool, LaunchCoordinator, LaunchError, PoolError};
pub use domain::{KeyRecord, LaunchAggregate, LaunchState, PoolStats};
