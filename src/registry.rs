//! The node registry: every backend that has registered, plus the latest load report for each.
//!
//! Both collections sit behind one lock so a scheduling decision always sees a consistent view.
//! Neither collection ever shrinks.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::models::{NodeInfo, NodeStats};
use crate::stats::{StatsReport, StatsStream};

#[derive(Debug, Default)]
struct RegistryInner {
    nodes: Vec<NodeInfo>,
    stats: HashMap<String, NodeStats>,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node. Duplicate addresses are kept as distinct entries.
    pub fn add_node(&self, node: NodeInfo) {
        self.inner.lock().nodes.push(node);
    }

    /// A snapshot of the node list in registration order.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.lock().nodes.clone()
    }

    pub fn first_node(&self) -> Option<NodeInfo> {
        self.inner.lock().nodes.first().cloned()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Inserts or replaces the stats stored under `address`.
    pub fn update_stats(&self, address: impl Into<String>, stats: NodeStats) {
        self.inner.lock().stats.insert(address.into(), stats);
    }

    /// A snapshot of the stats map.
    pub fn all_stats(&self) -> HashMap<String, NodeStats> {
        self.inner.lock().stats.clone()
    }

    pub fn stats_for(&self, address: &str) -> Option<NodeStats> {
        self.inner.lock().stats.get(address).copied()
    }

    pub fn stats_count(&self) -> usize {
        self.inner.lock().stats.len()
    }

    /// Runs `f` against the node list without cloning it.
    pub(crate) fn with_nodes<R>(&self, f: impl FnOnce(&[NodeInfo]) -> R) -> R {
        f(&self.inner.lock().nodes)
    }

    /// Runs `f` against the stats map without cloning it.
    pub(crate) fn with_stats<R>(&self, f: impl FnOnce(&HashMap<String, NodeStats>) -> R) -> R {
        f(&self.inner.lock().stats)
    }

    /// Applies one raw report. Malformed reports are dropped.
    pub fn ingest_report(&self, raw: &str) -> bool {
        match raw.parse::<StatsReport>() {
            Ok(report) => {
                trace!(address = %report.address(), ?report, "Applying stats report");
                self.update_stats(report.address(), report.stats());
                true
            }
            Err(e) => {
                trace!(raw, error = %e, "Dropping malformed stats report");
                false
            }
        }
    }

    /// Spawns a task that applies every report from `stream` until the stream closes.
    pub async fn receive_stats<S: StatsStream + Send + Sync + 'static>(
        self: &Arc<Self>,
        stream: S,
    ) -> Result<JoinHandle<()>, anyhow::Error> {
        let registry = Arc::clone(self);
        let mut rx = stream.receive().await?;

        Ok(tokio::spawn(async move {
            let mut applied = 0u64;
            while let Some(raw) = rx.recv().await {
                if registry.ingest_report(&raw) {
                    applied += 1;
                }
            }
            info!(applied, "Stats stream closed");
            debug!(nodes = registry.stats_count(), "Stats entries at close");
        }))
    }
}
