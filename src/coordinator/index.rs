//! In-memory placement index
//!
//! Tracks, for every file, its lifecycle status, size and replica set, and for
//! every registered dstore the mirror set of file names it holds. The index
//! performs no I/O; the coordinator owns it behind a single mutex so every
//! method here is one atomic step for concurrent readers.

use crate::common::{Error, NodeId, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Lifecycle of a file record. Absence means the file does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Storing,
    Stored,
    Removing,
}

/// File record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub status: FileStatus,
    pub size: u64,
    /// Holders in the order they were recorded
    pub replicas: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct NodeEntry {
    /// Join sequence, used to break load ties deterministically
    seq: u64,
    files: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct PlacementIndex {
    files: BTreeMap<String, FileRecord>,
    nodes: HashMap<NodeId, NodeEntry>,
    next_seq: u64,
}

impl PlacementIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // === Node operations ===

    /// Register a dstore. Returns false if it was already registered.
    pub fn register_node(&mut self, node: NodeId) -> bool {
        if self.nodes.contains_key(&node) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            node,
            NodeEntry {
                seq,
                files: BTreeSet::new(),
            },
        );
        true
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Registered dstores in join order
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<(u64, NodeId)> =
            self.nodes.iter().map(|(id, e)| (e.seq, *id)).collect();
        nodes.sort_unstable();
        nodes.into_iter().map(|(_, id)| id).collect()
    }

    /// Drop a dstore and every association it had. Files left without any
    /// replica are purged; their names are returned.
    pub fn remove_node(&mut self, node: NodeId) -> Vec<String> {
        let Some(entry) = self.nodes.remove(&node) else {
            return Vec::new();
        };

        let mut purged = Vec::new();
        for name in entry.files {
            if let Some(record) = self.files.get_mut(&name) {
                record.replicas.retain(|holder| *holder != node);
                if record.replicas.is_empty() {
                    self.files.remove(&name);
                    purged.push(name);
                }
            }
        }
        purged
    }

    /// The `k` least-loaded dstores, ties broken by join order.
    pub fn nodes_with_fewest_files(&self, k: usize) -> Vec<NodeId> {
        let mut nodes: Vec<(usize, u64, NodeId)> = self
            .nodes
            .iter()
            .map(|(id, e)| (e.files.len(), e.seq, *id))
            .collect();
        nodes.sort_unstable();
        nodes.into_iter().take(k).map(|(_, _, id)| id).collect()
    }

    /// File count per dstore, in join order
    pub fn node_loads(&self) -> Vec<(NodeId, usize)> {
        self.nodes()
            .into_iter()
            .map(|id| (id, self.nodes.get(&id).map_or(0, |e| e.files.len())))
            .collect()
    }

    // === File lifecycle ===

    pub fn record(&self, name: &str) -> Option<&FileRecord> {
        self.files.get(name)
    }

    pub fn status(&self, name: &str) -> Option<FileStatus> {
        self.files.get(name).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.files.iter()
    }

    /// Admit a new file in `Storing` status.
    pub fn record_storing(&mut self, name: &str, size: u64) -> Result<()> {
        if self.files.contains_key(name) {
            return Err(Error::FileAlreadyExists(name.to_string()));
        }
        self.files.insert(
            name.to_string(),
            FileRecord {
                status: FileStatus::Storing,
                size,
                replicas: Vec::new(),
            },
        );
        Ok(())
    }

    /// Promote a `Storing` file to `Stored` on the given holders.
    ///
    /// Fails without touching the index if the record is not `Storing` or a
    /// holder is no longer registered.
    pub fn commit_stored(&mut self, name: &str, holders: &[NodeId]) -> Result<()> {
        match self.files.get(name) {
            Some(record) if record.status == FileStatus::Storing => {}
            _ => return Err(Error::FileDoesNotExist(name.to_string())),
        }
        if let Some(missing) = holders.iter().find(|h| !self.nodes.contains_key(h)) {
            return Err(Error::NodeFailed(*missing));
        }

        for holder in holders {
            if let Some(entry) = self.nodes.get_mut(holder) {
                entry.files.insert(name.to_string());
            }
        }
        if let Some(record) = self.files.get_mut(name) {
            record.status = FileStatus::Stored;
            record.replicas = holders.to_vec();
        }
        Ok(())
    }

    /// Discard a record whose store did not reach quorum.
    pub fn rollback_failed_store(&mut self, name: &str) {
        if self.status(name) == Some(FileStatus::Storing) {
            self.drop_file(name);
        }
    }

    /// Move a `Stored` file to `Removing`, returning its current holders.
    pub fn mark_removing(&mut self, name: &str) -> Result<Vec<NodeId>> {
        match self.files.get_mut(name) {
            Some(record) if record.status == FileStatus::Stored => {
                record.status = FileStatus::Removing;
                Ok(record.replicas.clone())
            }
            _ => Err(Error::FileDoesNotExist(name.to_string())),
        }
    }

    /// Delete a file whose removal reached quorum.
    pub fn commit_removed(&mut self, name: &str) {
        self.drop_file(name);
    }

    fn drop_file(&mut self, name: &str) {
        if let Some(record) = self.files.remove(name) {
            for holder in record.replicas {
                if let Some(entry) = self.nodes.get_mut(&holder) {
                    entry.files.remove(name);
                }
            }
        }
    }

    // === Queries ===

    /// Size and holders of a `Stored` file.
    pub fn stored_replicas(&self, name: &str) -> Result<(u64, Vec<NodeId>)> {
        match self.files.get(name) {
            Some(record) if record.status == FileStatus::Stored => {
                Ok((record.size, record.replicas.clone()))
            }
            _ => Err(Error::FileDoesNotExist(name.to_string())),
        }
    }

    /// Names of every `Stored` file, sorted.
    pub fn snapshot_stored_file_names(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, r)| r.status == FileStatus::Stored)
            .map(|(name, _)| name.clone())
            .collect()
    }

    // === Reconciliation ===

    /// Replace every replica set with the given placement after a successful
    /// rebalance. Each referenced file becomes `Stored`, keeping its known
    /// size; files not referenced are dropped. Entries for unregistered
    /// dstores are ignored.
    pub fn replace_all(&mut self, placement: &BTreeMap<NodeId, BTreeSet<String>>) {
        let order = self.nodes();
        let mut files: BTreeMap<String, FileRecord> = BTreeMap::new();

        for node in &order {
            let held = placement.get(node).cloned().unwrap_or_default();
            for name in &held {
                let size = self.files.get(name).map_or(0, |r| r.size);
                files
                    .entry(name.clone())
                    .or_insert_with(|| FileRecord {
                        status: FileStatus::Stored,
                        size,
                        replicas: Vec::new(),
                    })
                    .replicas
                    .push(*node);
            }
            if let Some(entry) = self.nodes.get_mut(node) {
                entry.files = held;
            }
        }

        for node in placement.keys().filter(|n| !self.nodes.contains_key(n)) {
            tracing::warn!("Ignoring placement for unregistered dstore {}", node);
        }
        self.files = files;
    }

    /// Replica sets and reverse index agree for every (file, node) pair.
    pub fn is_consistent(&self) -> bool {
        let forward = self.files.iter().all(|(name, record)| {
            record
                .replicas
                .iter()
                .all(|n| self.nodes.get(n).is_some_and(|e| e.files.contains(name)))
        });
        let reverse = self.nodes.iter().all(|(id, entry)| {
            entry.files.iter().all(|name| {
                self.files
                    .get(name)
                    .is_some_and(|r| r.replicas.contains(id))
            })
        });
        forward && reverse
    }
}
