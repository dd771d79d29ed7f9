use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use corral::config::Config;
use corral::forwarder::{router, AppState};
use corral::health;
use corral::lifecycle;
use corral::pool::Pool;
use corral::runtime::{BollardRuntime, RuntimeAdapter};

/// Container-backed HTTP load balancer with autoscaling and failure
/// recovery. Configuration is read from the environment; these flags
/// override individual keys for local runs without a full env setup.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about)]
struct Cli {
    /// Worker image to spawn, overrides IMAGE_NAME.
    #[arg(long)]
    image: Option<String>,

    /// Balancer's listen port, overrides FAST_API_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Docker engine socket, overrides DOCKER_HOST.
    #[arg(long)]
    docker_host: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "corral exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(docker_host) = &cli.docker_host {
        std::env::set_var("DOCKER_HOST", docker_host);
    }

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(image) = cli.image {
        config.image_name = image;
    }
    if let Some(port) = cli.port {
        config.fast_api_port = port;
    }
    let config = Arc::new(config);

    let runtime_adapter: Arc<dyn RuntimeAdapter> =
        Arc::new(BollardRuntime::connect().context("container runtime unreachable")?);

    let pool = Arc::new(Pool::new(
        runtime_adapter.clone(),
        config.image_name.clone(),
        config.memory_limit.clone(),
        config.server_port,
        config.lb_port_start,
    ));

    lifecycle::startup(&pool, &config)
        .await
        .context("startup failed")?;

    let cancel = CancellationToken::new();
    let health_task = health::spawn(
        pool.clone(),
        runtime_adapter.clone(),
        config.clone(),
        cancel.clone(),
    );

    let state = AppState::new(pool.clone(), runtime_adapter.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.fast_api_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.fast_api_port))?;

    info!(port = config.fast_api_port, "corral listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    lifecycle::shutdown(&pool, &cancel).await;
    let _ = health_task.await;

    Ok(())
}
