//! # replistore
//!
//! A replicated file store with:
//! - A controller tracking which dstores hold which files
//! - Quorum-acknowledged stores and removals
//! - Periodic and join-triggered rebalancing of replicas and load
//! - A line-oriented TCP protocol, with file bytes moved directly between
//!   clients and dstores
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐  STORE/LOAD/REMOVE/LIST  ┌──────────────────────────┐
//!  │  Client  │─────────────────────────▶│        Controller        │
//!  └────┬─────┘                          │  placement index, quorum │
//!       │ STORE / LOAD_DATA              │  waits, rebalance engine │
//!       │                                └───────────┬──────────────┘
//!       │                                            │ JOIN, acks, LIST,
//!       │            ┌───────────────────────────────┤ REMOVE, REBALANCE
//!       │            │                │              │
//!  ┌────▼──────┐  ┌──▼────────┐  ┌────▼──────┐  ┌────▼──────┐
//!  │ Dstore A  │  │ Dstore B  │  │ Dstore C  │  │ Dstore D  │
//!  └───────────┘  └───────────┘  └───────────┘  └───────────┘
//!        ◀──────── REBALANCE_STORE (peer to peer) ────────▶
//! ```
//!
//! ## Usage
//!
//! ### Start a controller
//! ```bash
//! replistore-controller --port 4321 --replication-factor 3 \
//!   --timeout-ms 2000 --rebalance-period-ms 30000
//! ```
//!
//! ### Start dstores
//! ```bash
//! replistore-dstore --port 4322 --controller-port 4321 --data-dir ./dstore1
//! replistore-dstore --port 4323 --controller-port 4321 --data-dir ./dstore2
//! replistore-dstore --port 4324 --controller-port 4321 --data-dir ./dstore3
//! ```
//!
//! ### Use the CLI
//! ```bash
//! replistore store report.pdf --file ./report.pdf
//! replistore load report.pdf --output ./copy.pdf
//! replistore list
//! replistore remove report.pdf
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod coordinator;
pub mod dstore;

// Re-export commonly used types
pub use client::Client;
pub use common::{Config, Error, Result};
pub use coordinator::{Controller, Coordinator};
pub use dstore::Dstore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
