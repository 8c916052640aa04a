//! CLI for inserting data into a Freenet node.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod put;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use fcp::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fcp", version, about = "Freenet client protocol command line")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    /// Log protocol traffic at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Where and as whom to connect.
#[derive(clap::Args)]
struct NodeArgs {
    /// JSON configuration file (default: <config dir>/fcp/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Node host.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Node FCP port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Client name announced to the node.
    #[arg(long, global = true)]
    name: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Insert data and print the resulting key.
    Put(put::PutArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("fcp: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Put(args) => {
                let config = self.node.config()?;
                let client = Client::connect(&config).await.with_context(|| {
                    format!("failed to connect to {}:{}", config.host, config.port)
                })?;
                args.run(&client).await
            }
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "fcp", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

impl NodeArgs {
    /// Resolves configuration: file first, then command-line overrides.
    fn config(&self) -> Result<ClientConfig> {
        let path = match &self.config {
            Some(p) => Some(p.clone()),
            None => dirs::config_dir()
                .map(|d| d.join("fcp").join("config.json"))
                .filter(|p| p.exists()),
        };
        let mut config = match path {
            Some(p) => ClientConfig::load(&p)
                .with_context(|| format!("failed to load config {}", p.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(name) = &self.name {
            config.name.clone_from(name);
        }
        Ok(config)
    }
}
