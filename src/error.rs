//! Error types for the load balancer's control plane.
//!
//! Each layer gets its own `thiserror` enum so callers can match on the
//! failure they actually care about; `CorralError` is the top-level sum
//! type that escapes to `main`, where `anyhow::Context` adds process-level
//! detail.

use thiserror::Error;

/// Errors from the runtime adapter (container create/start/stop/sample).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    #[error("failed to start container: {0}")]
    StartFailed(String),

    #[error("container has no memory stats available (likely dead)")]
    MissingStats,

    #[error("failed to sample container stats: {0}")]
    SampleFailed(String),
}

/// Errors surfaced to a forwarded request's caller.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no backend is currently scheduled")]
    NoBackend,

    #[error("backend connection failed after retry")]
    BackendUnreachable,
}

/// Errors from loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("MIN_NODES ({min}) must be <= MAX_NODES ({max})")]
    BadBounds { min: u32, max: u32 },

    #[error("INITIAL_NODE_COUNT ({initial}) must be within [MIN_NODES, MAX_NODES] ({min}..={max})")]
    InitialOutOfBounds { initial: u32, min: u32, max: u32 },

    #[error(
        "MIN_MEMORY_USAGE_THRESHOLD ({min}) must be < MAX_MEMORY_USAGE_THRESHOLD ({max})"
    )]
    BadThresholds { min: f64, max: f64 },
}

/// Top-level error type for the process.
#[derive(Debug, Error)]
pub enum CorralError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("failed to bind listener on {0}")]
    Bind(String),
}
