use std::env;
use crate::app::cli::Args;
use crate::app::runner::run_application;
use crate::error::AppRunError;

pub mod app;
pub mod config;
pub mod device;
pub mod error;

pub fn init_logging(level: log::LevelFilter) -> Result<(), AppRunError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file).map_err(fern::InitError::Io)?);
    }

    dispatch.apply().map_err(fern::InitError::SetLoggerError)?;
    Ok(())
}

pub async fn run(args: Args) -> Result<(), AppRunError> {
    run_application(args).await
}
