use anyhow::Result;
use tracing::{info, error};

mod browser;
mod cli;
mod crawler;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let log_file = args.log_file.clone().or_else(|| args.log.then(utils::default_log_file));
    utils::init_logging(args.verbose, log_file)?;

    info!("Starting resumable crawler v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
