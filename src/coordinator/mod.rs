//! Replication controller
//!
//! The controller is responsible for:
//! - Fleet membership (dstores join, eviction on failure)
//! - Placement index (file → replicas, node → files)
//! - Admission of client STORE/LOAD/REMOVE/LIST requests
//! - Quorum acknowledgement rounds with dstores
//! - Periodic rebalancing of replicas and load

pub mod gate;
pub mod index;
pub mod links;
pub mod planner;
pub mod quorum;
pub mod rebalance;
pub mod server;
pub mod session;
pub mod state;

pub use rebalance::{RebalanceOutcome, RebalanceReport};
pub use server::Controller;
pub use state::{ClusterStatus, Coordinator};
