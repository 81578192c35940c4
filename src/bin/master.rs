//! # Master Binary Entry Point
//!
//! ```bash
//! cargo run --bin master -- --config config/master.toml --policy least_load
//! ```
//!
//! Listens for worker announcements, serves the task API when
//! `http_address` is set, and runs until Ctrl-C.

use clap::Parser;
use log::info;

use slave_pool::common::config::MasterConfig;
use slave_pool::common::logging::init_logger;
use slave_pool::master::{Master, PolicyKind};

/// Command-line arguments for the master binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the master configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Placement policy, overriding the configuration file
    #[arg(short, long)]
    policy: Option<PolicyKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MasterConfig::from_file(path)?,
        None => MasterConfig::default(),
    };
    if let Some(policy) = args.policy {
        config.master.policy = policy;
    }

    let master = Master::new(config)?;
    master.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    master.close().await;

    Ok(())
}
