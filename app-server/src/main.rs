use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use coursegen_engine::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Course generation app server speaking JSON lines on stdio.
#[derive(Parser, Debug)]
#[command(name = "coursegen-app-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the engine configuration file
    #[arg(short, long, value_name = "FILE", env = "COURSEGEN_CONFIG")]
    config: Option<PathBuf>,

    /// Course attached to every generation request
    #[arg(long, value_name = "ID")]
    course: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    tokio::select! {
        result = coursegen_app_server::run_main(config, args.course) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    }
}
