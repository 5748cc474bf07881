//! oc-daemon binary
//!
//! Exit codes: 0 orderly shutdown, 1 configuration error, 2 startup
//! error, 3 fatal runtime error.

use clap::Parser;
use futures::StreamExt;
use oc_daemon_core::{logging, Config, Daemon, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;
use std::process::exit;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// OpenConnect VPN daemon for Linux
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Loads the daemon configuration. A missing file at the default location
/// falls back to defaults; an explicitly given missing file is an error.
fn load_config(args: &Args) -> anyhow::Result<Config> {
    if !args.config.exists() && args.config == PathBuf::from(DEFAULT_CONFIG_FILE) {
        return Ok(Config::default());
    }
    let config = Config::load(&args.config)?;
    config.validate()?;
    Ok(config)
}

/// Cancels the shutdown token on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    if let Ok(mut signals) = signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        if signals.next().await.is_some() {
            info!("received termination signal");
            shutdown.cancel();
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("oc-daemon: configuration error: {:#}", e);
            exit(1);
        }
    };
    logging::init(config.verbose || args.verbose);

    let mut daemon = Daemon::new(config);
    tokio::spawn(wait_for_signal(daemon.shutdown_token()));

    if let Err(e) = daemon.run().await {
        error!("daemon error: {}", e);
        exit(if daemon.startup_complete() { 3 } else { 2 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::parse_from(["oc-daemon", "--verbose"]);
        assert!(args.verbose);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));

        let args = Args::parse_from(["oc-daemon", "--config", "/tmp/test.json"]);
        assert_eq!(args.config, PathBuf::from("/tmp/test.json"));
    }

    #[test]
    fn test_load_config_explicit_missing_file() {
        let args = Args::parse_from(["oc-daemon", "--config", "/nonexistent/oc.json"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oc-daemon.json");
        std::fs::write(&path, r#"{"Verbose": true}"#).unwrap();

        let args = Args::parse_from(["oc-daemon", "--config", path.to_str().unwrap()]);
        let config = load_config(&args).unwrap();
        assert!(config.verbose);
    }

    #[test]
    fn test_load_config_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oc-daemon.json");
        std::fs::write(&path, "{}").unwrap();

        let args = Args::parse_from(["oc-daemon", "--config", path.to_str().unwrap()]);
        assert!(load_config(&args).is_err());
    }
}
