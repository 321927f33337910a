//! NBD data-plane server: reads its configuration, populates the handler
//! registry, and runs the single-threaded reactor.

mod config;
mod reactor;
mod session;

use std::sync::Arc;

use clap::Parser;
use config::Config;
use nbd_backend::Registry;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "nbd-server")]
#[command(about = "NBD data-plane server")]
#[command(version)]
struct Args {
    /// Path to the server's TOML configuration file.
    config: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", args.config))?;
    let config: Config = toml::from_str(&config_str)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", args.config))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = Arc::new(build_registry(&config));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(reactor::run(
        &config.server.address,
        config.server.port,
        registry,
        config.server.max_errors,
    ));

    if let Err(e) = &result {
        error!("nbd-server exiting with error: {e}");
    } else {
        info!("nbd-server exiting");
    }
    result
}

fn build_registry(config: &Config) -> Registry {
    let mut registry = Registry::new();

    registry.register_loaded(
        "mem",
        Arc::new(nbd_backend_mem::MemBackendFactory::new(
            config.server.mem_size_bytes,
        )),
    );

    match &config.backends.rbd {
        Some(rbd) => {
            registry.register_loaded(
                "rbd",
                Arc::new(nbd_backend_rbd::RbdBackendFactory::new(
                    rbd.image_service_endpoint.clone(),
                )),
            );
        }
        None => {
            warn!("rbd backend unavailable: no [backends.rbd] configured");
            registry.register_unavailable(
                "rbd",
                "rbd backend requires image_service_endpoint in [backends.rbd]".to_string(),
            );
        }
    }

    registry
}
