//! Runtime adapter: the narrow interface over the container runtime.
//!
//! Mirrors the shape of the teacher's backend trait (`ExecutionBackend`) —
//! a small `async_trait` over create/health/cleanup — generalized to the
//! container lifecycle this balancer actually drives: start with a memory
//! cap and port mapping, sample memory stats, stop and force-remove.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::RuntimeError;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A single non-streaming memory sample from the runtime.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    /// Percentage of the memory limit currently in use, in `[0, 100]`.
    pub fn used_pct(&self) -> f64 {
        if self.limit_bytes == 0 {
            0.0
        } else {
            (self.used_bytes as f64 / self.limit_bytes as f64) * 100.0
        }
    }
}

/// Narrow interface over the container runtime.
///
/// All operations may fail with a [`RuntimeError`]. Implementations must be
/// `Send + Sync` so a single adapter can be shared behind an `Arc` across
/// the forwarding hot path and the health loop.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync + std::fmt::Debug {
    /// Create and start a detached worker container, mapping
    /// `container_port` inside the container to `host_port` on the host.
    /// Returns the runtime's opaque container identifier.
    async fn start(
        &self,
        image: &str,
        memory_limit: &str,
        container_port: u16,
        host_port: u16,
    ) -> RuntimeResult<String>;

    /// Stop then force-remove a container. Idempotent: a second call on an
    /// already-removed container is a no-op — runtime errors are logged and
    /// swallowed, never propagated.
    async fn stop_and_remove(&self, container_id: &str);

    /// A single non-streaming memory sample. Fails with
    /// [`RuntimeError::MissingStats`] once the container has died and no
    /// memory fields are present in the stats payload — this is the
    /// liveness/failure detector the health loop relies on.
    async fn sample(&self, container_id: &str) -> RuntimeResult<MemorySample>;
}

/// Production runtime adapter, talking to a Docker-API-compatible engine
/// (Docker or Podman) over its default socket (or `DOCKER_HOST`, if set).
#[derive(Debug, Clone)]
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl RuntimeAdapter for BollardRuntime {
    async fn start(
        &self,
        image: &str,
        memory_limit: &str,
        container_port: u16,
        host_port: u16,
    ) -> RuntimeResult<String> {
        let memory_bytes = parse_memory_limit(memory_limit).ok_or_else(|| {
            RuntimeError::StartFailed(format!("invalid MEMORY_LIMIT: {memory_limit}"))
        })?;

        let container_port_key = format!("{container_port}/tcp");
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port_key.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port_key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            memory: Some(memory_bytes),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(image.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("corral-node-{host_port}"),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;

        Ok(created.id)
    }

    async fn stop_and_remove(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            debug!(container_id, error = %e, "stop_container failed (already stopped?)");
        }

        if let Err(e) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container_id, error = %e, "remove_container failed, swallowing");
        }
    }

    async fn sample(&self, container_id: &str) -> RuntimeResult<MemorySample> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        let stats = stream
            .next()
            .await
            .ok_or(RuntimeError::MissingStats)?
            .map_err(|e| RuntimeError::SampleFailed(e.to_string()))?;

        let usage = stats.memory_stats.usage.ok_or(RuntimeError::MissingStats)?;
        let limit = stats.memory_stats.limit.ok_or(RuntimeError::MissingStats)?;

        Ok(MemorySample {
            used_bytes: usage,
            limit_bytes: limit,
        })
    }
}

/// Parse a human-readable memory cap ("280m", "1g", "512k") into bytes.
fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim();
    let (digits, multiplier) = match limit.chars().last() {
        Some('k') | Some('K') => (&limit[..limit.len() - 1], 1024),
        Some('m') | Some('M') => (&limit[..limit.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        _ => (limit, 1),
    };
    digits.trim().parse::<i64>().ok().map(|n| n * multiplier)
}

/// In-memory runtime used by tests and the `FakeRuntime`-backed test suite.
/// Exercises the Pool, health loop and forwarder deterministically without
/// a real container runtime or network.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    next_id: AtomicU64,
    /// Per-container forced sample override; `None` entries mean
    /// "missing stats" (the container is considered dead).
    samples: parking_lot::Mutex<HashMap<String, Option<MemorySample>>>,
    /// Containers that should fail to start, by image name.
    fail_start: parking_lot::Mutex<bool>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Force the next `sample()` result for a given container id.
    pub fn set_sample(&self, container_id: &str, sample: Option<MemorySample>) {
        self.samples
            .lock()
            .insert(container_id.to_string(), sample);
    }

    /// Force every sampled Node to report `used_pct` on its next sample.
    pub fn set_all_used_pct(&self, container_ids: &[String], used_pct: f64) {
        let mut samples = self.samples.lock();
        for id in container_ids {
            samples.insert(
                id.clone(),
                Some(MemorySample {
                    used_bytes: (used_pct * 10_000.0) as u64,
                    limit_bytes: 1_000_000,
                }),
            );
        }
    }

    /// Mark a container as dead: the next `sample()` call returns
    /// `MissingStats`.
    pub fn kill(&self, container_id: &str) {
        self.samples.lock().insert(container_id.to_string(), None);
    }

    pub fn fail_next_start(&self, fail: bool) {
        *self.fail_start.lock() = fail;
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn start(
        &self,
        _image: &str,
        _memory_limit: &str,
        _container_port: u16,
        host_port: u16,
    ) -> RuntimeResult<String> {
        if *self.fail_start.lock() {
            return Err(RuntimeError::StartFailed("forced failure".to_string()));
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{n:08x}fake{host_port}");
        self.samples.lock().insert(
            id.clone(),
            Some(MemorySample {
                used_bytes: 0,
                limit_bytes: 1_000_000,
            }),
        );
        Ok(id)
    }

    async fn stop_and_remove(&self, container_id: &str) {
        self.samples.lock().remove(container_id);
    }

    async fn sample(&self, container_id: &str) -> RuntimeResult<MemorySample> {
        match self.samples.lock().get(container_id) {
            Some(Some(sample)) => Ok(*sample),
            Some(None) => Err(RuntimeError::MissingStats),
            None => Err(RuntimeError::MissingStats),
        }
    }
}
