//! un-votes-harvester binary
//!
//! Usage: `un-votes-harvester [config.json]`. Settings can also be overridden
//! with `HARVEST_*` environment variables, e.g. `HARVEST_CRAWL__WORKERS=4`.
//! Ctrl-C stops the run at the next link boundary and exits with status 130.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use un_votes_harvester::infrastructure::{HttpSessionFactory, MetadataExtractor, logging};
use un_votes_harvester::{ConfigManager, HarvestError, Harvester};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            // Logging may not be up yet
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let manager = ConfigManager::from_args(std::env::args());
    let config = manager.load_config()?;
    logging::init_logging_with_config(&config.logging)?;
    info!("Configuration: {}", serde_json::to_string(&config)?);

    let harvester = Harvester::new(
        config,
        Arc::new(HttpSessionFactory::default()),
        Arc::new(MetadataExtractor::new()),
    );

    let cancel = harvester.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current link and closing sessions");
            cancel.cancel();
        }
    });

    match harvester.run().await {
        Ok(summary) => {
            info!("Run summary: {}", serde_json::to_string(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(HarvestError::Interrupted) => Ok(ExitCode::from(130)),
        Err(e) => {
            error!("Harvest aborted: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
