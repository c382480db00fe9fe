use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use layergraph::cmd::{self, Cli};

/// Env var controlling log verbosity, in `EnvFilter` syntax.
const LOGGING_ENV: &str = "LAYERGRAPH_LOG";

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_env_var(LOGGING_ENV)
        .try_from_env()
        .unwrap_or_else(|_| "layergraph=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    cmd::run(&Cli::parse())
}
