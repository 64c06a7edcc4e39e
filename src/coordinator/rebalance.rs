//! Rebalance engine
//!
//! One cycle freezes placement-mutating requests, collects every dstore's
//! listing, plans a target placement, sends each affected dstore a combined
//! push/evict instruction and adopts the target only once every instruction
//! completed. Cycles run on a fixed period and whenever a join grows the fleet
//! past the replication factor.

use crate::common::protocol::{self, NodeReply};
use crate::common::{NodeId, Result};
use crate::coordinator::index::FileStatus;
use crate::coordinator::links::Expect;
use crate::coordinator::planner::{self, View};
use crate::coordinator::quorum::{LIST_TOKEN, REBALANCE_TOKEN};
use crate::coordinator::state::{Coordinator, OnTimeout};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// Instructions were executed and the index adopted the new placement
    Completed,
    /// Placement already satisfied every bound
    Balanced,
    /// Fleet smaller than the replication factor; nothing was attempted
    Skipped,
    /// Too few dstores answered the listing round
    Aborted(String),
    /// An instruction failed; the previous index stands
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RebalanceReport {
    pub outcome: RebalanceOutcome,
    /// Dstores that answered the listing round
    pub responders: usize,
    /// Replicas copied between dstores
    pub pushed: usize,
    /// Replicas deleted from dstores
    pub evicted: usize,
    pub duration: Duration,
}

struct Tally {
    outcome: RebalanceOutcome,
    responders: usize,
    pushed: usize,
    evicted: usize,
}

impl Tally {
    fn new(outcome: RebalanceOutcome) -> Self {
        Self {
            outcome,
            responders: 0,
            pushed: 0,
            evicted: 0,
        }
    }
}

impl Coordinator {
    /// Run one rebalance cycle to completion.
    pub async fn rebalance(self: &Arc<Self>) -> RebalanceReport {
        let started = Instant::now();
        let tally = {
            let _freeze = self.gate.freeze().await;
            tracing::debug!("Rebalance: sessions frozen");
            match self.run_cycle().await {
                Ok(tally) => tally,
                Err(e) => Tally::new(RebalanceOutcome::Failed(e.to_string())),
            }
        };

        let report = RebalanceReport {
            outcome: tally.outcome,
            responders: tally.responders,
            pushed: tally.pushed,
            evicted: tally.evicted,
            duration: started.elapsed(),
        };
        match &report.outcome {
            RebalanceOutcome::Completed => tracing::info!(
                "Rebalance completed in {:?}: {} pushed, {} evicted across {} dstores",
                report.duration,
                report.pushed,
                report.evicted,
                report.responders
            ),
            RebalanceOutcome::Balanced => tracing::debug!("Rebalance: placement already balanced"),
            RebalanceOutcome::Skipped => tracing::debug!("Rebalance skipped: fleet too small"),
            RebalanceOutcome::Aborted(reason) => tracing::warn!("Rebalance aborted: {}", reason),
            RebalanceOutcome::Failed(reason) => tracing::error!("Rebalance failed: {}", reason),
        }

        *self
            .last_rebalance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());

        let status = self.status();
        tracing::info!(
            "Fleet: {} dstores, {} stored files, loads {:?}",
            status.nodes.len(),
            status.stored_files.len(),
            status.nodes
        );
        report
    }

    async fn run_cycle(self: &Arc<Self>) -> Result<Tally> {
        let r = self.config.replication_factor;
        if self.index().node_count() < r {
            return Ok(Tally::new(RebalanceOutcome::Skipped));
        }

        let view = self.collect_listings().await?;
        if view.len() < r {
            let mut tally = Tally::new(RebalanceOutcome::Aborted(format!(
                "{} of {} required dstores answered",
                view.len(),
                r
            )));
            tally.responders = view.len();
            return Ok(tally);
        }

        let sizes: BTreeMap<String, u64> = self
            .index()
            .records()
            .filter(|(_, record)| record.status == FileStatus::Stored)
            .map(|(name, record)| (name.clone(), record.size))
            .collect();
        let plan = planner::plan(&view, &sizes, r);
        if !plan.orphans.is_empty() {
            tracing::info!("Rebalance: evicting unindexed files {:?}", plan.orphans);
        }

        let mut tally = Tally::new(RebalanceOutcome::Balanced);
        tally.responders = view.len();
        if plan.is_noop() {
            self.index().replace_all(&plan.target);
            return Ok(tally);
        }

        for instruction in plan.instructions.values() {
            tally.pushed += instruction
                .pushes
                .iter()
                .map(|push| push.destinations.len())
                .sum::<usize>();
            tally.evicted += instruction.removals.len();
        }

        let wait = self
            .quorum
            .begin_wait(REBALANCE_TOKEN, plan.instructions.len())?;
        let mut legs = Vec::with_capacity(plan.instructions.len());
        let mut sends = Vec::with_capacity(plan.instructions.len());
        for (node, instruction) in &plan.instructions {
            let Some(link) = self.links.get(*node) else {
                wait.signaller().fail(&format!("dstore {} left", node));
                continue;
            };
            legs.push(self.spawn_leg(
                &link,
                Expect::Rebalance,
                wait.signaller(),
                OnTimeout::Evict,
            ));
            let line = instruction.encode();
            sends.push(async move {
                let sent = link.send(&line).await;
                (link, sent)
            });
        }
        for (link, sent) in join_all(sends).await {
            if let Err(e) = sent {
                self.evict_node(link.node(), &format!("instruction not delivered: {}", e));
            }
        }

        let required = wait.require(self.config.timeout()).await;
        // Evictions by timed-out legs land before the cycle reports
        for leg in join_all(legs).await {
            if let Err(e) = leg {
                tracing::warn!("Rebalance leg panicked: {}", e);
            }
        }
        match required {
            Ok(()) => {
                self.index().replace_all(&plan.target);
                tally.outcome = RebalanceOutcome::Completed;
            }
            Err(e) => tally.outcome = RebalanceOutcome::Failed(e.to_string()),
        }
        Ok(tally)
    }

    /// Ask every registered dstore for its files. Dstores that fail to answer
    /// are evicted and left out of the view.
    async fn collect_listings(self: &Arc<Self>) -> Result<View> {
        let links = self.links.all();
        let wait = self.quorum.begin_wait(LIST_TOKEN, links.len())?;

        let mut legs: Vec<(NodeId, JoinHandle<Option<NodeReply>>)> = Vec::with_capacity(links.len());
        for link in &links {
            legs.push((
                link.node(),
                self.spawn_leg(link, Expect::List, wait.signaller(), OnTimeout::Evict),
            ));
        }
        let sends = links.iter().map(|link| async move {
            (link.node(), link.send(protocol::LIST).await)
        });
        for (node, sent) in join_all(sends).await {
            if let Err(e) = sent {
                self.evict_node(node, &format!("list not delivered: {}", e));
            }
        }

        let outcome = wait.block(self.config.timeout()).await;
        tracing::debug!(
            "Rebalance: {}/{} listings ({:?})",
            wait.received(),
            wait.expected(),
            outcome
        );

        let mut view = View::new();
        for (node, leg) in legs {
            match leg.await {
                Ok(Some(NodeReply::List(files))) => {
                    view.insert(node, files.into_iter().collect());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Listing leg for dstore {} panicked: {}", node, e),
            }
        }

        let index = self.index();
        view.retain(|node, _| index.contains_node(*node));
        Ok(view)
    }

    /// Drive rebalance cycles until the returned task is aborted.
    pub fn start_rebalance_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let period = coordinator.config.rebalance_period();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = coordinator.rebalance_trigger.notified() => {
                        tracing::debug!("Rebalance triggered by join");
                    }
                }
                coordinator.rebalance().await;
            }
        })
    }
}
