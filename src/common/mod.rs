//! Common utilities and types shared across replistore

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{Config, ControllerConfig, DstoreConfig};
pub use error::{Error, Result};

/// A dstore is identified by the port it listens on.
pub type NodeId = u16;
