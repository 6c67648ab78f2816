use std::path::PathBuf;
use clap::Parser;

use crate::config::types::ScanMode;

/// Reads the distance from a dynamo driven odometer over bluetooth low energy.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Use the simulated device instead of scanning for the real one
    #[arg(long, conflicts_with = "live")]
    pub simulated: bool,

    /// Scan for the real device
    #[arg(long)]
    pub live: bool,

    /// Path of the config file (default: next to the executable or in the user config directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Exit after this many distance readings
    #[arg(long, value_name = "N")]
    pub readings: Option<u64>,

    /// Log debug messages
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// The scan mode requested on the command line, if any.
    pub fn scan_mode(&self) -> Option<ScanMode> {
        match (self.simulated, self.live) {
            (true, _) => Some(ScanMode::Simulated),
            (_, true) => Some(ScanMode::Live),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mode_flags() {
        let args = Args::try_parse_from(["ddo-odometer", "--live", "--readings", "3"]).unwrap();
        assert_eq!(args.scan_mode(), Some(ScanMode::Live));
        assert_eq!(args.readings, Some(3));

        let args = Args::try_parse_from(["ddo-odometer"]).unwrap();
        assert_eq!(args.scan_mode(), None);

        assert!(Args::try_parse_from(["ddo-odometer", "--live", "--simulated"]).is_err());
    }
}
