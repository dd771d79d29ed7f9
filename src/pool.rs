//! The worker pool: live Nodes, the port allocator, and the scheduled node.
//!
//! State discipline follows the concurrency model in the spec: `nodes` and
//! `next_port` are mutated only under a pool-wide mutex (runtime calls
//! happen outside the lock so they never stall a forwarder), while
//! `scheduled_node` is an [`arc_swap::ArcSwapOption`] so a reader sees
//! either the old pointer or a new one, never a torn value — the same
//! pattern the teacher's edge service uses for its backend picker.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::node::Node;
use crate::runtime::RuntimeAdapter;

struct PoolInner {
    nodes: Vec<Node>,
    next_port: u16,
}

/// Owns the ordered set of live Nodes, the monotonically increasing port
/// allocator, and the currently-selected scheduled node.
pub struct Pool {
    runtime: Arc<dyn RuntimeAdapter>,
    image: String,
    memory_limit: String,
    container_port: u16,
    inner: Mutex<PoolInner>,
    scheduled: ArcSwapOption<Node>,
}

impl Pool {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        image: String,
        memory_limit: String,
        container_port: u16,
        lb_port_start: u16,
    ) -> Self {
        Self {
            runtime,
            image,
            memory_limit,
            container_port,
            inner: Mutex::new(PoolInner {
                nodes: Vec::new(),
                next_port: lb_port_start,
            }),
            scheduled: ArcSwapOption::empty(),
        }
    }

    /// Allocate `k` ports from `next_port`, start `k` containers, append to
    /// `nodes`. On a mid-batch runtime error, Nodes started so far stay in
    /// the pool and the error is propagated — the next health tick will
    /// observe and replace whatever didn't make it in.
    pub async fn add(&self, k: u32) -> Result<(), RuntimeError> {
        if k == 0 {
            return Ok(());
        }
        let start_port = {
            let mut inner = self.inner.lock();
            let start = inner.next_port;
            inner.next_port = inner.next_port.saturating_add(k as u16);
            start
        };

        for i in 0..k {
            let host_port = start_port + i as u16;
            let container_id = self
                .runtime
                .start(&self.image, &self.memory_limit, self.container_port, host_port)
                .await?;
            info!(host_port, container_id, "node started");
            let node = Node::new(host_port, container_id);
            self.inner.lock().nodes.push(node);
        }
        Ok(())
    }

    /// Pop up to `k` Nodes from the tail, stop-and-remove each, decrementing
    /// `next_port` per pop. Bounded by the pool's current length.
    pub async fn remove(&self, k: u32) {
        for _ in 0..k {
            let popped = self.inner.lock().nodes.pop();
            let Some(node) = popped else { break };
            self.runtime.stop_and_remove(&node.container_id).await;
            {
                let mut inner = self.inner.lock();
                inner.next_port = inner.next_port.saturating_sub(1);
            }
            info!(host_port = node.host_port, "node removed (scale-down)");
        }
    }

    /// Remove each Node in `failed` regardless of position, preserving
    /// survivor order, then `add(len(failed))` to restore the count.
    /// `next_port` is NOT decremented for these removals — retiring a port
    /// requires knowing no later Node reused it, which only holds at the
    /// tail.
    pub async fn replace_failed(&self, failed: &[Node]) -> Result<(), RuntimeError> {
        if failed.is_empty() {
            return Ok(());
        }
        for node in failed {
            self.runtime.stop_and_remove(&node.container_id).await;
        }
        let failed_ids: Vec<&str> = failed.iter().map(|n| n.container_id.as_str()).collect();
        {
            let mut inner = self.inner.lock();
            inner
                .nodes
                .retain(|n| !failed_ids.contains(&n.container_id.as_str()));
        }
        warn!(count = failed.len(), "replacing failed nodes");

        // If the scheduled node was among the failed set, it no longer
        // lives in `nodes` — republish from a survivor so a caller that
        // re-reads `scheduled_node` right after this call (the forwarder's
        // retry path) targets a live Node instead of looping back onto the
        // one that was just torn down. Picks the first survivor, same as
        // the design note's precedent for `handle_failure`'s `min_node`;
        // the next health pass corrects it to the true minimum.
        if let Some(scheduled) = self.get_scheduled() {
            if failed_ids.contains(&scheduled.container_id.as_str()) {
                let survivor = self.inner.lock().nodes.first().cloned();
                self.set_scheduled(survivor);
            }
        }

        self.add(failed.len() as u32).await
    }

    pub fn get_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Snapshot of the live Nodes, in insertion order. Used by the health
    /// loop's sample phase.
    pub fn snapshot(&self) -> Vec<Node> {
        self.inner.lock().nodes.clone()
    }

    pub fn get_scheduled(&self) -> Option<Node> {
        self.scheduled.load_full().map(|arc| (*arc).clone())
    }

    pub fn set_scheduled(&self, node: Option<Node>) {
        self.scheduled.store(node.map(Arc::new));
    }

    /// Replace a Node's stored memory sample in place (health loop only).
    pub fn update_sample(&self, container_id: &str, used_pct: f64) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner
            .nodes
            .iter_mut()
            .find(|n| n.container_id == container_id)
        {
            node.record_sample(used_pct);
        }
    }
}
