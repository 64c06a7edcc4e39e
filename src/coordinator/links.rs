//! Control connections to registered dstores
//!
//! The read half of a dstore's connection stays with its session task; the
//! write half lives here so any operation can send commands while the session
//! keeps reading replies. Operations register what reply they expect before
//! sending a command, and the session routes each reply to its expectation.

use crate::common::protocol::{self, NodeReply};
use crate::common::{Error, NodeId, Result};
use crate::coordinator::quorum::{remove_token, store_token, LIST_TOKEN, REBALANCE_TOKEN};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifies one registration of an expectation key
pub type ExpectId = u64;

/// A reply an operation is waiting for on one dstore
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expect {
    Store(String),
    Remove(String),
    List,
    Rebalance,
}

impl Expect {
    pub fn for_reply(reply: &NodeReply) -> Self {
        match reply {
            NodeReply::StoreAck(name) => Expect::Store(name.clone()),
            NodeReply::RemoveAck(name) | NodeReply::RemoveMissing(name) => {
                Expect::Remove(name.clone())
            }
            NodeReply::List(_) => Expect::List,
            NodeReply::RebalanceComplete => Expect::Rebalance,
        }
    }

    /// Quorum token of the operation this reply belongs to
    pub fn token(&self) -> String {
        match self {
            Expect::Store(name) => store_token(name),
            Expect::Remove(name) => remove_token(name),
            Expect::List => LIST_TOKEN.to_string(),
            Expect::Rebalance => REBALANCE_TOKEN.to_string(),
        }
    }
}

pub struct NodeLink {
    node: NodeId,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<Expect, (ExpectId, oneshot::Sender<NodeReply>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("node", &self.node)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl NodeLink {
    pub fn new(node: NodeId, writer: BoxedWriter) -> Self {
        Self {
            node,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one command line to the dstore.
    pub async fn send(&self, line: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NodeFailed(self.node));
        }
        let mut writer = self.writer.lock().await;
        protocol::write_line(&mut *writer, line).await
    }

    /// Register interest in a reply. The receiver fails if the link closes first.
    pub fn expect(&self, key: Expect) -> (ExpectId, oneshot::Receiver<NodeReply>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return (id, rx);
        }
        if pending.insert(key.clone(), (id, tx)).is_some() {
            tracing::warn!("Dstore {}: replaced outstanding expectation {:?}", self.node, key);
        }
        (id, rx)
    }

    /// Withdraw an expectation whose listener gave up. A newer registration
    /// under the same key is left alone.
    pub fn forget(&self, key: &Expect, id: ExpectId) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.get(key).is_some_and(|(current, _)| *current == id) {
            pending.remove(key);
            true
        } else {
            false
        }
    }

    /// Route a reply to its expectation, handing it back if nobody waits for it.
    pub fn deliver(&self, reply: NodeReply) -> std::result::Result<(), NodeReply> {
        let key = Expect::for_reply(&reply);
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        match sender {
            Some((_, tx)) => tx.send(reply),
            None => Err(reply),
        }
    }

    /// Fail every outstanding expectation and shut the write direction down.
    pub fn close(self: &Arc<Self>) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.clear();
        }

        let link = self.clone();
        tokio::spawn(async move {
            let mut writer = link.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Dstore {}: shutdown failed: {}", link.node, e);
            }
        });
    }
}

/// Dstore identity → control connection
#[derive(Debug, Default)]
pub struct LinkTable {
    links: Mutex<BTreeMap<NodeId, Arc<NodeLink>>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a link, returning the one it replaced.
    pub fn insert(&self, link: Arc<NodeLink>) -> Option<Arc<NodeLink>> {
        self.lock().insert(link.node(), link)
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<NodeLink>> {
        self.lock().get(&node).cloned()
    }

    /// Remove the link for `node`, but only if it is `link`.
    pub fn remove_if(&self, node: NodeId, link: &Arc<NodeLink>) -> bool {
        let mut links = self.lock();
        if links.get(&node).is_some_and(|l| Arc::ptr_eq(l, link)) {
            links.remove(&node);
            true
        } else {
            false
        }
    }

    pub fn remove(&self, node: NodeId) -> Option<Arc<NodeLink>> {
        self.lock().remove(&node)
    }

    pub fn all(&self) -> Vec<Arc<NodeLink>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, Arc<NodeLink>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
