//! ==============================================================================
//! main.rs - plant sensor node entry point
//! ==============================================================================
//!
//! responsibilities:
//!     - load configuration (config/sensor-node.toml or defaults)
//!     - set up logging
//!     - pick the channel backend (phidget22 bridge or mock)
//!     - run the node until ctrl-c, then let every task close its channel
//!
//! ==============================================================================

use anyhow::Result;
use plant_sensor_node::config::{Backend, NodeConfig};
use plant_sensor_node::hal::{ChannelProvider, MockProvider, Phidget22Provider};
use plant_sensor_node::runtime;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Plant Sensor Node");
    println!("===========================================================");

    // step 1: load configuration
    let config = NodeConfig::load_or_default();
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the config file)
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .init();

    // step 3: channel backend
    let provider: Arc<dyn ChannelProvider> = match config.sensors.backend {
        Backend::Phidget22 => {
            let mut provider = Phidget22Provider::new(
                config.sensors.python.clone(),
                config.sensors.reply_timeout(),
            );
            if let Some(path) = &config.sensors.python_path {
                provider = provider.with_python_path(path.clone());
            }
            Arc::new(provider)
        }
        Backend::Mock => Arc::new(MockProvider::new()),
    };

    // step 4: run until interrupted or a sensor fails
    let token = CancellationToken::new();
    let node = {
        let token = token.clone();
        tokio::spawn(async move {
            let result = runtime::run(&config, provider, token.clone()).await;
            token.cancel();
            result
        })
    };

    tokio::select! {
        _ = token.cancelled() => {}
        res = signal::ctrl_c() => {
            match res {
                Ok(_) => tracing::info!("Keyboard Interrupt. Exiting."),
                Err(e) => tracing::error!("Failed to listen for ctrl_c. Error: {}", e),
            }
            token.cancel();
        },
    }

    match node.await? {
        Ok(stats) => {
            tracing::info!("Stopped after {} uplink attempts", stats.total());
            Ok(())
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            Err(e)
        }
    }
}
