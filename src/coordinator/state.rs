//! Request coordination
//!
//! The [`Coordinator`] owns the placement index, the dstore link table, the
//! quorum registry and the freeze gate. Sessions hand it one request at a
//! time; it validates the request against the fleet, mutates the index under
//! its lock and drives the acknowledgement rounds with the dstores.

use crate::common::protocol::{self, Request};
use crate::common::{ControllerConfig, Error, NodeId, Result};
use crate::coordinator::gate::{FreezeGate, GateState};
use crate::coordinator::index::{FileRecord, PlacementIndex};
use crate::coordinator::links::{Expect, LinkTable, NodeLink};
use crate::coordinator::quorum::{remove_token, store_token, QuorumWaiter, Signaller};
use crate::coordinator::rebalance::RebalanceReport;
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Requests queued on a client session
pub type Inbox = mpsc::Receiver<Request>;

/// What a leg listener does when its dstore stays silent past the timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTimeout {
    /// Fail the leg only
    Report,
    /// Fail the leg and drop the dstore from the fleet
    Evict,
}

/// Snapshot of the coordinator for operators and tests
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    /// File count per dstore in join order
    pub nodes: Vec<(NodeId, usize)>,
    pub stored_files: Vec<String>,
    pub gate: GateState,
    pub last_rebalance: Option<RebalanceReport>,
}

pub struct Coordinator {
    pub(crate) config: ControllerConfig,
    index: Mutex<PlacementIndex>,
    pub(crate) links: LinkTable,
    pub(crate) quorum: QuorumWaiter,
    pub(crate) gate: FreezeGate,
    pub(crate) rebalance_trigger: Notify,
    pub(crate) last_rebalance: Mutex<Option<RebalanceReport>>,
}

impl Coordinator {
    pub fn new(config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            index: Mutex::new(PlacementIndex::new()),
            links: LinkTable::new(),
            quorum: QuorumWaiter::new(),
            gate: FreezeGate::new(),
            rebalance_trigger: Notify::new(),
            last_rebalance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub(crate) fn index(&self) -> MutexGuard<'_, PlacementIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ClusterStatus {
        let (nodes, stored_files) = {
            let index = self.index();
            (index.node_loads(), index.snapshot_stored_file_names())
        };
        ClusterStatus {
            nodes,
            stored_files,
            gate: self.gate.state(),
            last_rebalance: self
                .last_rebalance
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Current record of a file, if any
    pub fn placement(&self, name: &str) -> Option<FileRecord> {
        self.index().record(name).cloned()
    }

    fn check_fleet(&self, index: &PlacementIndex) -> Result<()> {
        let needed = self.config.replication_factor;
        let available = index.node_count();
        if available < needed {
            return Err(Error::NotEnoughDstores { needed, available });
        }
        Ok(())
    }

    // === Fleet membership ===

    /// Register a dstore and its control link. Triggers a rebalance once the
    /// fleet grows past the replication factor.
    pub fn join(&self, link: Arc<NodeLink>) {
        let node = link.node();
        let count = {
            let mut index = self.index();
            if !index.register_node(node) {
                // A rejoining dstore starts with an empty data directory
                let purged = index.remove_node(node);
                index.register_node(node);
                tracing::warn!(
                    "Dstore {} joined again, replacing its connection and dropping {} replicas",
                    node,
                    purged.len()
                );
                if !purged.is_empty() {
                    tracing::warn!("Files lost with dstore {}: {:?}", node, purged);
                }
            }
            index.node_count()
        };
        if let Some(previous) = self.links.insert(link) {
            previous.close();
        }

        tracing::info!("Dstore {} joined ({} in fleet)", node, count);
        if count > self.config.replication_factor {
            self.rebalance_trigger.notify_one();
        }
    }

    /// Drop a dstore suspected dead, cascading through the index.
    pub fn evict_node(&self, node: NodeId, reason: &str) {
        let purged = {
            let mut index = self.index();
            if !index.contains_node(node) {
                return;
            }
            index.remove_node(node)
        };
        if let Some(link) = self.links.remove(node) {
            link.close();
        }
        tracing::warn!("Evicted dstore {}: {}", node, reason);
        if !purged.is_empty() {
            tracing::warn!("Files lost with dstore {}: {:?}", node, purged);
        }
    }

    /// Called when a dstore's control connection ends.
    pub(crate) fn disconnect(&self, link: &Arc<NodeLink>) {
        let node = link.node();
        if self.links.remove_if(node, link) {
            link.close();
            self.evict_node(node, "connection closed");
        } else {
            link.close();
        }
    }

    /// Arm an expectation on `link` and spawn the listener reporting it to `signaller`.
    ///
    /// The expectation is registered before this returns, so the command may
    /// be sent right after.
    pub(crate) fn spawn_leg(
        self: &Arc<Self>,
        link: &Arc<NodeLink>,
        expect: Expect,
        signaller: Signaller,
        on_timeout: OnTimeout,
    ) -> JoinHandle<Option<protocol::NodeReply>> {
        let deadline = tokio::time::Instant::now() + self.config.timeout();
        let (id, rx) = link.expect(expect.clone());
        let link = link.clone();
        let coordinator = self.clone();

        tokio::spawn(async move {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(reply)) => {
                    tracing::debug!("Dstore {} answered {}", link.node(), expect.token());
                    signaller.arrive();
                    Some(reply)
                }
                Ok(Err(_)) => {
                    signaller.fail(&format!("dstore {} disconnected", link.node()));
                    None
                }
                Err(_) => {
                    link.forget(&expect, id);
                    tracing::warn!(
                        "Dstore {} timed out on {}",
                        link.node(),
                        expect.token()
                    );
                    if on_timeout == OnTimeout::Evict {
                        coordinator.evict_node(link.node(), "acknowledgement timeout");
                    }
                    signaller.fail(&format!("dstore {} timed out", link.node()));
                    None
                }
            }
        })
    }

    // === Request dispatch ===

    /// Serve one client request. Returns a request the client sent while this
    /// one was waiting for it, which the session dispatches next.
    pub async fn dispatch<W>(
        self: &Arc<Self>,
        request: Request,
        out: &mut W,
        inbox: &mut Inbox,
    ) -> Option<Request>
    where
        W: AsyncWrite + Unpin,
    {
        let _permit = if request.is_critical() {
            Some(self.gate.enter_critical().await)
        } else {
            None
        };

        let result = match request {
            Request::Store { name, size } => self.store(out, &name, size).await.map(|_| None),
            Request::Load(name) | Request::Reload(name) => self.load(out, inbox, &name).await,
            Request::Remove(name) => self.remove(out, &name).await.map(|_| None),
            Request::List => self.list(out).await.map(|_| None),
            Request::Join(port) => {
                tracing::warn!("Ignoring JOIN {} on a client session", port);
                Ok(None)
            }
            Request::Unknown(token) => {
                tracing::warn!("Unknown request: {}", token);
                Ok(None)
            }
        };

        match result {
            Ok(next) => next,
            Err(e) => {
                match e.wire_token() {
                    Some(token) => {
                        tracing::info!("Refused request: {}", e);
                        if let Err(io) = protocol::write_line(out, token).await {
                            tracing::debug!("Could not report refusal: {}", io);
                        }
                    }
                    None => tracing::error!("Request failed: {}", e),
                }
                None
            }
        }
    }

    /// STORE: admit, pick the least-loaded dstores, wait for all of them to
    /// acknowledge, then commit or roll back.
    pub async fn store<W>(self: &Arc<Self>, out: &mut W, name: &str, size: u64) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let r = self.config.replication_factor;
        let targets = {
            let mut index = self.index();
            self.check_fleet(&index)?;
            index.record_storing(name, size)?;
            index.nodes_with_fewest_files(r)
        };

        let result = self.replicate(out, name, &targets).await;
        match result {
            Ok(()) => {
                tracing::info!("Stored {} ({} bytes) on {:?}", name, size, targets);
                protocol::write_line(out, protocol::STORE_COMPLETE).await
            }
            Err(e) => {
                self.index().rollback_failed_store(name);
                tracing::warn!("Store of {} rolled back: {}", name, e);
                Err(e)
            }
        }
    }

    async fn replicate<W>(self: &Arc<Self>, out: &mut W, name: &str, targets: &[NodeId]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let wait = self.quorum.begin_wait(store_token(name), targets.len())?;
        for node in targets {
            match self.links.get(*node) {
                Some(link) => {
                    self.spawn_leg(
                        &link,
                        Expect::Store(name.to_string()),
                        wait.signaller(),
                        OnTimeout::Report,
                    );
                }
                None => wait.signaller().fail(&format!("dstore {} has no link", node)),
            }
        }

        let ports: Vec<String> = targets.iter().map(|p| p.to_string()).collect();
        protocol::write_line(out, &format!("{} {}", protocol::STORE_TO, ports.join(" "))).await?;

        wait.require(self.config.timeout()).await?;
        self.index().commit_stored(name, targets)
    }

    /// LOAD: offer each holder in turn until the client stops asking for another.
    pub async fn load<W>(&self, out: &mut W, inbox: &mut Inbox, name: &str) -> Result<Option<Request>>
    where
        W: AsyncWrite + Unpin,
    {
        let (size, candidates) = {
            let index = self.index();
            self.check_fleet(&index)?;
            index.stored_replicas(name)?
        };

        for node in candidates {
            protocol::write_line(out, &format!("{} {} {}", protocol::LOAD_FROM, node, size)).await?;
            match tokio::time::timeout(self.config.timeout(), inbox.recv()).await {
                // Silence means the client got the file.
                Err(_) | Ok(None) => return Ok(None),
                Ok(Some(Request::Reload(again))) if again == name => {
                    tracing::debug!("Client could not load {} from {}", name, node);
                }
                Ok(Some(other)) => return Ok(Some(other)),
            }
        }
        Err(Error::LoadExhausted(name.to_string()))
    }

    /// REMOVE: tell every holder to delete, counting "not found" as done.
    pub async fn remove<W>(self: &Arc<Self>, out: &mut W, name: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let holders = {
            let mut index = self.index();
            self.check_fleet(&index)?;
            index.mark_removing(name)?
        };

        let wait = self.quorum.begin_wait(remove_token(name), holders.len())?;
        let mut sends = Vec::with_capacity(holders.len());
        for node in &holders {
            let Some(link) = self.links.get(*node) else {
                wait.signaller().fail(&format!("dstore {} has no link", node));
                continue;
            };
            self.spawn_leg(
                &link,
                Expect::Remove(name.to_string()),
                wait.signaller(),
                OnTimeout::Evict,
            );
            sends.push(async move {
                let sent = link.send(&format!("{} {}", protocol::REMOVE, name)).await;
                (link, sent)
            });
        }
        for (link, sent) in join_all(sends).await {
            if let Err(e) = sent {
                self.evict_node(link.node(), &format!("remove not delivered: {}", e));
            }
        }

        match wait.require(self.config.timeout()).await {
            Ok(()) => {
                self.index().commit_removed(name);
                tracing::info!("Removed {}", name);
                protocol::write_line(out, protocol::REMOVE_COMPLETE).await
            }
            Err(e) => {
                tracing::error!("Remove of {} incomplete, left for rebalance: {}", name, e);
                Err(e)
            }
        }
    }

    /// LIST: names of every stored file.
    pub async fn list<W>(&self, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let names = {
            let index = self.index();
            self.check_fleet(&index)?;
            index.snapshot_stored_file_names()
        };
        protocol::write_line(out, &protocol::list_line(&names)).await
    }
}
