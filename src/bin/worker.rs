//! # Worker Binary Entry Point
//!
//! ```bash
//! cargo run --bin worker -- --config config/worker.toml --id 2
//! ```
//!
//! Announces itself to the master, then executes offered tasks with the echo
//! executor until the master closes the channels or Ctrl-C is pressed.

use clap::Parser;
use log::info;

use slave_pool::common::config::WorkerConfig;
use slave_pool::common::logging::init_logger;
use slave_pool::common::messages::SlaveId;
use slave_pool::worker::Worker;

/// Command-line arguments for the worker binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the worker configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Worker id, overriding the configuration file
    #[arg(short, long)]
    id: Option<SlaveId>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(id) = args.id {
        config.worker.id = id;
    }

    let worker = Worker::new(config.worker);
    let stopper = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            stopper.shutdown();
        }
    });

    worker.run().await?;
    Ok(())
}
