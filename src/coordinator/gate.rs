//! Freeze gate between placement-mutating requests and rebalancing
//!
//! STORE, REMOVE and JOIN run while holding a critical permit. A rebalance
//! takes the freeze, which waits for in-flight critical operations to finish
//! and holds back new ones until it is released. The underlying lock is fair,
//! so held-back requests resume in the order they arrived.

use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Observable gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Busy,
    Frozen,
}

#[derive(Debug, Clone, Default)]
pub struct FreezeGate {
    lock: Arc<RwLock<()>>,
}

/// Held for the duration of one critical operation
#[derive(Debug)]
pub struct CriticalPermit {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Held by the rebalance engine; dropping it unfreezes every session
#[derive(Debug)]
pub struct Freeze {
    _guard: OwnedRwLockWriteGuard<()>,
}

impl FreezeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no rebalance is running (or queued ahead of us), then enter.
    pub async fn enter_critical(&self) -> CriticalPermit {
        CriticalPermit {
            _guard: self.lock.clone().read_owned().await,
        }
    }

    /// Stop new critical operations and wait for in-flight ones to drain.
    pub async fn freeze(&self) -> Freeze {
        Freeze {
            _guard: self.lock.clone().write_owned().await,
        }
    }

    pub fn state(&self) -> GateState {
        match self.lock.try_write() {
            Ok(_) => GateState::Idle,
            Err(_) => match self.lock.try_read() {
                Ok(_) => GateState::Busy,
                Err(_) => GateState::Frozen,
            },
        }
    }
}
