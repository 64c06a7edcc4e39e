//! Counting quorum waits
//!
//! An operation arms a wait for a number of acknowledgements, hands cheap
//! [`Signaller`] clones to the tasks listening on each leg, and blocks on the
//! [`WaitHandle`] until every acknowledgement arrived, a leg broke, or the
//! timeout elapsed. Waits are registered under a token so two operations on
//! the same file or cycle can never wait at once.

use crate::common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Result of blocking on a quorum wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
    /// A leg reported a failure that makes the quorum unreachable
    Broken,
}

#[derive(Debug, Clone, Copy)]
struct LatchState {
    remaining: usize,
    broken: bool,
    closed: bool,
}

#[derive(Debug)]
struct Latch {
    token: String,
    expected: usize,
    state: watch::Sender<LatchState>,
}

/// Handle used by listener tasks to report one leg's outcome
#[derive(Debug, Clone)]
pub struct Signaller {
    latch: Arc<Latch>,
}

impl Signaller {
    /// Count one acknowledgement. Returns false if the signal was dropped
    /// because the wait was already released or abandoned.
    pub fn arrive(&self) -> bool {
        let mut counted = false;
        self.latch.state.send_modify(|s| {
            if s.remaining > 0 && !s.broken && !s.closed {
                s.remaining -= 1;
                counted = true;
            }
        });
        if !counted {
            tracing::debug!("Dropping late signal for {}", self.latch.token);
        }
        counted
    }

    /// Mark the quorum unreachable, releasing the blocked operation early.
    pub fn fail(&self, reason: &str) {
        self.latch.state.send_modify(|s| {
            if s.remaining > 0 && !s.closed {
                s.broken = true;
            }
        });
        tracing::debug!("Quorum {} broken: {}", self.latch.token, reason);
    }
}

/// Owned by the operation that armed the wait
#[derive(Debug)]
pub struct WaitHandle {
    latch: Arc<Latch>,
    registry: Arc<Mutex<HashMap<String, Signaller>>>,
}

impl WaitHandle {
    pub fn signaller(&self) -> Signaller {
        Signaller {
            latch: self.latch.clone(),
        }
    }

    pub fn expected(&self) -> usize {
        self.latch.expected
    }

    /// Acknowledgements counted so far
    pub fn received(&self) -> usize {
        self.latch.expected - self.latch.state.borrow().remaining
    }

    /// Block until the quorum is met, a leg breaks it, or `timeout` elapses.
    pub async fn block(&self, timeout: Duration) -> WaitOutcome {
        let mut rx = self.latch.state.subscribe();
        // The borrowed state must be released before the latch is closed.
        let outcome = {
            let waited = tokio::time::timeout(
                timeout,
                rx.wait_for(|s| s.remaining == 0 || s.broken),
            )
            .await;
            match waited {
                Ok(Ok(state)) if state.remaining == 0 => WaitOutcome::Satisfied,
                Ok(_) => WaitOutcome::Broken,
                Err(_) => WaitOutcome::TimedOut,
            }
        };
        self.latch.state.send_modify(|s| s.closed = true);
        outcome
    }

    /// Like [`block`](Self::block), mapping anything but success to an error.
    pub async fn require(&self, timeout: Duration) -> Result<()> {
        match self.block(timeout).await {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::TimedOut => Err(Error::Timeout(self.latch.token.clone())),
            WaitOutcome::Broken => Err(Error::QuorumNotReached {
                token: self.latch.token.clone(),
                expected: self.latch.expected,
                received: self.received(),
            }),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.latch.state.send_modify(|s| s.closed = true);
        let mut waits = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if waits
            .get(&self.latch.token)
            .is_some_and(|s| Arc::ptr_eq(&s.latch, &self.latch))
        {
            waits.remove(&self.latch.token);
        }
    }
}

/// Registry of outstanding quorum waits keyed by operation token
#[derive(Debug, Clone, Default)]
pub struct QuorumWaiter {
    waits: Arc<Mutex<HashMap<String, Signaller>>>,
}

impl QuorumWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a wait for `expected` acknowledgements under `token`.
    pub fn begin_wait(&self, token: impl Into<String>, expected: usize) -> Result<WaitHandle> {
        let token = token.into();
        let mut waits = self.waits.lock().unwrap_or_else(PoisonError::into_inner);
        if waits.contains_key(&token) {
            return Err(Error::DuplicateWait(token));
        }

        let (state, _) = watch::channel(LatchState {
            remaining: expected,
            broken: false,
            closed: false,
        });
        let latch = Arc::new(Latch {
            token: token.clone(),
            expected,
            state,
        });
        waits.insert(
            token,
            Signaller {
                latch: latch.clone(),
            },
        );

        Ok(WaitHandle {
            latch,
            registry: self.waits.clone(),
        })
    }
}

/// Token for a file's store acknowledgements
pub fn store_token(name: &str) -> String {
    format!("store-ack:{}", name)
}

/// Token for a file's removal acknowledgements
pub fn remove_token(name: &str) -> String {
    format!("remove-ack:{}", name)
}

pub const LIST_TOKEN: &str = "list:global";
pub const REBALANCE_TOKEN: &str = "rebalance:global";
