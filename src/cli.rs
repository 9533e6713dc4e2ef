//! `fixture-foundry` command line: bring an environment up by hand, print
//! how to reach it, and tear it down when stdin closes or on SIGINT/SIGTERM.

use crate::infra::FoundryConfig;
use crate::services::Orchestrator;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "fixture-foundry",
    version,
    about = "Ephemeral Docker, LocalStack and Pulumi infrastructure for integration tests"
)]
pub struct Cli {
    /// Configuration file (default: ./fixture-foundry.toml when present)
    #[arg(long, env = "FOUNDRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Leave containers and networks in place on exit
    #[arg(long)]
    pub no_teardown: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Create (or reuse) the shared bridge network
    Network,
    /// Start PostgreSQL
    Postgres {
        /// Do not join the shared network
        #[arg(long)]
        standalone: bool,
    },
    /// Start LocalStack
    Localstack {
        /// Do not join the shared network
        #[arg(long)]
        standalone: bool,
    },
    /// Network, PostgreSQL and LocalStack wired together
    Env,
}

/// Why [`hold`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Signal,
    StdinClosed,
}

pub fn run(cli: Cli) -> Result<()> {
    // Installed first: a Ctrl-C during startup must still unwind the guards.
    let (tx, rx) = mpsc::channel();
    let signals = tx.clone();
    ctrlc::set_handler(move || {
        let _ = signals.send(Release::Signal);
    })
    .context("installing signal handler")?;

    let mut config = FoundryConfig::load(cli.config.as_deref())?;
    if cli.no_teardown {
        config.teardown = false;
    }

    let foundry = Orchestrator::from_config(config)?;

    match cli.command {
        Commands::Network => {
            let network = foundry.network()?;
            publish(&network.handle().name)?;
            hold(tx, &rx);
        }
        Commands::Postgres { standalone } => {
            let network = if standalone { None } else { Some(foundry.network()?) };
            let db = foundry.postgres(network.as_ref())?;
            publish(&db.connection())?;
            hold(tx, &rx);
        }
        Commands::Localstack { standalone } => {
            let network = if standalone { None } else { Some(foundry.network()?) };
            let emulator = foundry.localstack(network.as_ref())?;
            publish(&emulator.connection())?;
            hold(tx, &rx);
        }
        Commands::Env => {
            let env = foundry.environment()?;
            publish(&env.connection())?;
            hold(tx, &rx);
        }
    }

    Ok(())
}

fn publish<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing connection info")?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

/// Blocks until stdin reaches EOF (Ctrl-D, or the parent closing the pipe)
/// or the process receives SIGINT/SIGTERM. The caller's guards drop after
/// this returns.
fn hold(tx: Sender<Release>, rx: &Receiver<Release>) {
    info!("ready; close stdin or press Ctrl-C to tear down");
    thread::spawn(move || {
        let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
        let _ = tx.send(Release::StdinClosed);
    });

    match wait_for_release(rx) {
        Release::Signal => info!("signal received, tearing down"),
        Release::StdinClosed => info!("stdin closed, tearing down"),
    }
}

fn wait_for_release(rx: &Receiver<Release>) -> Release {
    // Every sender gone means nothing can wake us; treat it as EOF.
    rx.recv().unwrap_or(Release::StdinClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_flags() {
        let cli = Cli::try_parse_from(["fixture-foundry", "--no-teardown", "postgres", "--standalone"])
            .unwrap();
        assert!(cli.no_teardown);
        assert_eq!(cli.command, Commands::Postgres { standalone: true });

        let cli = Cli::try_parse_from(["fixture-foundry", "--config", "ci.toml", "env"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("ci.toml")));
        assert_eq!(cli.command, Commands::Env);
    }

    #[test]
    fn signal_from_another_thread_releases_the_wait() {
        let (tx, rx) = mpsc::channel();
        let _stdin_side = tx.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            tx.send(Release::Signal).unwrap();
        });

        assert_eq!(wait_for_release(&rx), Release::Signal);
        handle.join().unwrap();
    }

    #[test]
    fn wait_ends_when_every_sender_is_gone() {
        let (tx, rx) = mpsc::channel::<Release>();
        drop(tx);

        assert_eq!(wait_for_release(&rx), Release::StdinClosed);
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["fixture-foundry", "deploy-everything"]).is_err());
    }
}
