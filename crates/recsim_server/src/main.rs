//! Binary entrypoint for the `recsim` dashboard backend.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recsim_query::testing::write_default_fixture;
use recsim_server::{run, summarize, RecsimConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recsim", version, about = "Recommendation-similarity query service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the query API and health endpoints (default).
    Serve {
        /// Overrides RECSIM_SNAPSHOT.
        #[arg(long)]
        snapshot: Option<String>,
        /// Overrides RECSIM_HTTP_ADDR.
        #[arg(long)]
        http_addr: Option<SocketAddr>,
    },
    /// Load the snapshot, print its summary as JSON and exit.
    Summary {
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Write the deterministic demo snapshot.
    Fixture {
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("recsim_server=info,recsim_query=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve {
        snapshot: None,
        http_addr: None,
    });
    match command {
        Command::Serve {
            snapshot,
            http_addr,
        } => {
            let mut config = RecsimConfig::from_env()?;
            if let Some(snapshot) = snapshot {
                config.snapshot = snapshot;
            }
            if let Some(http_addr) = http_addr {
                config.http_addr = http_addr;
            }
            run(config).await
        }
        Command::Summary { snapshot } => {
            let mut config = RecsimConfig::from_env()?;
            if let Some(snapshot) = snapshot {
                config.snapshot = snapshot;
            }
            let summary = summarize(&config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&*summary).context("encode summary")?
            );
            Ok(())
        }
        Command::Fixture { output } => {
            if let Some(parent) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            write_default_fixture(&output)
                .with_context(|| format!("write fixture {}", output.display()))?;
            println!("{}", output.display());
            Ok(())
        }
    }
}
