//! Storage daemon (dstore)
//!
//! Holds file replicas in a flat local directory, accepts uploads and
//! downloads from clients, pushes replicas to peers when the controller
//! rebalances, and answers the controller's LIST/REMOVE/REBALANCE commands.

pub mod server;
pub mod store;

pub use server::Dstore;
pub use store::FileStore;
