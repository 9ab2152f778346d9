//! 'main' for the Breakwater node process

use anyhow::Result;
use breakwater_common::messages::Message;
use caryatid_process::Process;
use config::{Config, Environment, File};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

// External modules
use breakwater_module_block_synchronizer::BlockSynchronizer;
use breakwater_module_chain_applier::ChainApplier;
use breakwater_module_history_responder::HistoryResponder;

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    Registry::default().with(fmt_layer).init();

    info!("Breakwater node process");

    // Read the config
    let config = Arc::new(
        Config::builder()
            .add_source(File::with_name("node"))
            .add_source(Environment::with_prefix("BREAKWATER"))
            .build()?,
    );

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    ChainApplier::register(&mut process);
    BlockSynchronizer::register(&mut process);
    HistoryResponder::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");

    Ok(())
}
