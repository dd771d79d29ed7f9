//! Startup and shutdown orchestration.
//!
//! Matches the teacher daemon's shutdown discipline: a
//! [`CancellationToken`] threaded into the long-lived health task, observed
//! at the next tick boundary rather than interrupting an in-flight runtime
//! call.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::CorralError;
use crate::pool::Pool;

/// Bring up `INITIAL_NODE_COUNT` workers. The periodic loop is armed by the
/// caller separately; requests arriving before the first health pass
/// observe a null scheduled node, by design.
pub async fn startup(pool: &Pool, config: &Config) -> Result<(), CorralError> {
    info!(count = config.initial_node_count, "starting initial nodes");
    pool.add(config.initial_node_count)
        .await
        .map_err(CorralError::Runtime)?;
    Ok(())
}

/// Tear down every live Node. Runtime errors are logged and swallowed —
/// the process must not hang on a non-responsive container runtime.
pub async fn shutdown(pool: &Pool, cancel: &CancellationToken) {
    info!("shutdown initiated, cancelling health loop");
    cancel.cancel();

    let count = pool.get_count();
    info!(count, "tearing down nodes");
    pool.remove(count as u32).await;
}
