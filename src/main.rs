//! Oxidized-MRE - MRE application runtime
//!
//! Main entry point: loads a package and runs the app manager loop.

use anyhow::bail;
use clap::Parser;
use om_core::{logging, Config};
use om_integration::{AppManager, Dispatcher, HostServices, NullRuntime};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "oxidized-mre", version, about = "Run an MRE package")]
struct Args {
    /// Package to launch (.vxp)
    package: PathBuf,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Launch as a system app
    #[arg(long)]
    local: bool,

    /// Print the loaded app as JSON and exit
    #[arg(long)]
    info: bool,

    /// Run this many manager iterations, then shut down
    #[arg(long, value_name = "N")]
    ticks: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let package = args.package;

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    logging::init(&config.debug)?;

    tracing::info!("Starting Oxidized-MRE");

    let dispatcher = Arc::new(Dispatcher::new());
    let services = HostServices::from_config(&config)?;
    let mut manager = AppManager::new(dispatcher.clone(), services, Box::new(NullRuntime));

    dispatcher.add_app_for_launch(package.clone(), args.local);

    if args.info {
        let (launched, _) = manager.launch_apps();
        if launched == 0 {
            bail!("could not load {}", package.display());
        }
        println!("{}", serde_json::to_string_pretty(&manager.reports())?);
        manager.shutdown();
        return Ok(());
    }

    match args.ticks {
        Some(ticks) => {
            for _ in 0..ticks {
                manager.run_once();
            }
            manager.shutdown();
        }
        None => manager.run(&AtomicBool::new(false)),
    }

    Ok(())
}
