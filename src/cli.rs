use clap::Parser;
use std::path::PathBuf;

const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Drive the message pipeline with a synthetic player and two demo panels
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Panel frame rate (overrides config)
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<f64>,

    /// Synthetic player emit rate in Hz
    #[arg(long = "source-rate", value_name = "HZ", default_value_t = 30.0)]
    pub source_rate: f64,

    /// How long to run, in seconds
    #[arg(short = 'd', long = "duration", value_name = "SECS", default_value_t = 5.0)]
    pub duration: f64,

    /// Topic to subscribe to (can be specified multiple times)
    #[arg(short = 't', long = "topic", value_name = "TOPIC")]
    pub topics: Vec<String>,

    /// Per-frame render delay of the slow panel, in milliseconds (0 disables it)
    #[arg(long = "slow-panel-ms", value_name = "MS", default_value_t = 0)]
    pub slow_panel_ms: u64,

    /// Seek back to the start every N seconds
    #[arg(long = "seek-every", value_name = "SECS")]
    pub seek_every: Option<f64>,

    /// Inject one out-of-order message every N frames
    #[arg(long = "reorder-every", value_name = "N")]
    pub reorder_every: Option<u64>,

    /// Pipeline config file (JSON)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log to file instead of stderr (default: msgpipe.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::parse_from(["msgpipe"]);
        assert_eq!(args.source_rate, 30.0);
        assert!(args.topics.is_empty());
        assert!(args.log_file.is_none());
        assert_eq!(args.verbosity, 0);
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from(["msgpipe", "--fps", "30", "-t", "/a", "-t", "/b", "-vv", "--log", "--seek-every", "2.5"]);
        assert_eq!(args.fps, Some(30.0));
        assert_eq!(args.topics, vec!["/a", "/b"]);
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.log_file, Some(None));
        assert_eq!(args.seek_every, Some(2.5));
    }
}
