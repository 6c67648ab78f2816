use clap::Parser;
use log::{error, info};
use ddo_odometer::app::cli::Args;
use ddo_odometer::error::{AppRunError, ConfigError};
use ddo_odometer::{init_logging, run};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })?;
    info!(concat!("DDO Odometer ", env!("CARGO_PKG_VERSION")));

    match run(args).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
