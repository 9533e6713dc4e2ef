use anyhow::Result;
use clap::Parser;
use fixture_foundry::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // stdout carries the connection JSON; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    cli::run(Cli::parse())
}
