use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use osqueue::broker::Broker;
use osqueue::clock::system_clock;
use osqueue::settings::AppConfig;
use osqueue::storage::open_backend;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Run an osqueue broker against the configured object store
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    osqueue::trace::init(cfg.log_format)?;
    if args.verbose {
        info!(?cfg, "loaded configuration");
    }

    let storage = open_backend(&cfg.storage, cfg.throttle.clone())?;
    let broker = Broker::start(storage, cfg.broker_options(system_clock())).await?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown requested");
        }
        _ = broker.stopped() => {
            warn!("broker lost leadership");
        }
    }
    broker.stop();
    Ok(())
}
