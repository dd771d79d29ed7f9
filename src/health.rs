//! The periodic health & autoscale loop.
//!
//! One pass: sample every Node concurrently, select the least-loaded
//! survivor, repair the pool around whatever died, publish the new
//! scheduled node, then consider scaling. Modeled on the teacher's
//! `run_health_checks` background task — a `tokio::time::interval` driving
//! a fan-out of per-backend probes joined back together — generalized from
//! a binary up/down health bit to a continuous memory-utilization signal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::node::Node;
use crate::pool::Pool;
use crate::runtime::RuntimeAdapter;

/// Spawn the health loop as a long-lived task. Ticks never overlap: the
/// next tick only starts sleeping once the current pass has returned.
/// Cancellation is observed at the next sleep boundary, in-flight runtime
/// calls are allowed to finish.
pub fn spawn(
    pool: Arc<Pool>,
    runtime: Arc<dyn RuntimeAdapter>,
    config: Arc<Config>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.health_check_time_secs);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = run_pass(&pool, runtime.as_ref(), &config).await {
                        error!(error = %e, "health pass failed, retrying next tick");
                    }
                }
            }
        }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("repair failed: {0}")]
    Repair(#[from] crate::error::RuntimeError),
}

/// Run a single health pass: sample, select, repair, publish, autoscale.
pub async fn run_pass(
    pool: &Pool,
    runtime: &dyn RuntimeAdapter,
    config: &Config,
) -> Result<(), HealthError> {
    let snapshot = pool.snapshot();

    // Sample phase: every Node probed concurrently, the pass as a whole
    // still completes before the next tick is considered.
    let samples = sample_all(runtime, &snapshot).await;

    let mut active: Vec<Node> = Vec::new();
    let mut failed: Vec<Node> = Vec::new();
    for (mut node, sample) in snapshot.into_iter().zip(samples) {
        match sample {
            Ok(s) => {
                node.record_sample(s.used_pct());
                pool.update_sample(&node.container_id, s.used_pct());
                active.push(node);
            }
            Err(_) => {
                warn!(container_id = %node.container_id, "node missing stats, marking failed");
                failed.push(node);
            }
        }
    }

    // Selection phase.
    let min_node = argmin_by_memory(&active);

    // Repair phase: must precede autoscale so autoscale sees a consistent
    // length but still judges utilization from the *sampled* active list.
    if !failed.is_empty() {
        pool.replace_failed(&failed).await?;
    }

    // Publish phase.
    if let Some(node) = min_node {
        pool.set_scheduled(Some(node));
    } else {
        info!("active set empty, leaving scheduled node as-is");
    }

    // Autoscale phase: mutually exclusive branches, skipped entirely when
    // active is empty.
    if !active.is_empty() {
        let all_over = active
            .iter()
            .all(|n| n.memory_used_pct.unwrap_or(0.0) > config.max_memory_usage_threshold);
        let all_under = active
            .iter()
            .all(|n| n.memory_used_pct.unwrap_or(100.0) < config.min_memory_usage_threshold);

        if all_over {
            try_scale_up(pool, config).await?;
        } else if all_under {
            try_scale_down(pool, config).await;
        }
    }

    Ok(())
}

async fn sample_all(
    runtime: &dyn RuntimeAdapter,
    nodes: &[Node],
) -> Vec<crate::runtime::RuntimeResult<crate::runtime::MemorySample>> {
    // RuntimeAdapter is held behind &dyn here (not Arc), so probes run as
    // joined futures rather than spawned tasks — still concurrent, no
    // per-request blocking, and avoids requiring `runtime: 'static` for a
    // borrow that only needs to outlive this pass.
    let futures = nodes.iter().map(|n| runtime.sample(&n.container_id));
    futures::future::join_all(futures).await
}

fn argmin_by_memory(active: &[Node]) -> Option<Node> {
    active
        .iter()
        .min_by(|a, b| {
            let a_pct = a.memory_used_pct.unwrap_or(f64::MAX);
            let b_pct = b.memory_used_pct.unwrap_or(f64::MAX);
            a_pct.partial_cmp(&b_pct).unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
}

async fn try_scale_up(pool: &Pool, config: &Config) -> Result<(), HealthError> {
    let current = pool.get_count() as u32;
    if current + config.scale_up_node_count >= config.max_nodes {
        info!(current, max = config.max_nodes, "scale-up refused at cap");
        return Ok(());
    }
    info!(current, step = config.scale_up_node_count, "scaling up");
    pool.add(config.scale_up_node_count).await?;
    Ok(())
}

async fn try_scale_down(pool: &Pool, config: &Config) {
    let current = pool.get_count() as u32;
    if current < config.scale_down_node_count
        || current - config.scale_down_node_count < config.min_nodes
    {
        info!(current, min = config.min_nodes, "scale-down refused at floor");
        return;
    }
    info!(current, step = config.scale_down_node_count, "scaling down");
    pool.remove(config.scale_down_node_count).await;
}
