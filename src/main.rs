//! Setu agent binary
//!
//! Usage:
//!   setu --dir /opt/setu
//!   setu --dir /opt/setu --config /etc/setu.toml --log-level debug

use clap::Parser;
use setu::{Agent, AgentConfig, Result, logging};
use std::path::PathBuf;

/// On-device cloud link agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Application directory (sidecar script, logs, default config)
    #[arg(short, long, default_value = "./")]
    dir: PathBuf,

    /// Configuration file path (default: <dir>/setu.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override [logging] level
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| AgentConfig::default_path(&args.dir));

    let mut config = match AgentConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
            log::error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    if let Some(path) = logging::init(&config.logging, &args.dir)? {
        log::info!("Logging to {}", path.display());
    }
    log::info!(
        "Setu v{} starting (dir {}, config {})",
        env!("CARGO_PKG_VERSION"),
        args.dir.display(),
        config_path.display()
    );

    let reason = Agent::new(config, args.dir).run()?;
    log::info!("Setu stopped: {:?}", reason);
    Ok(())
}
