//! `fcp put`: insert a file, standard input or a redirect.
//!
//! Usage: `fcp put [OPTIONS] URI (--file PATH | --stdin | --redirect URI)`

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use fcp::Client;
use tokio::io::AsyncReadExt;

/// Arguments for `fcp put`.
#[derive(clap::Args)]
#[command(group(clap::ArgGroup::new("source").required(true).args(["file", "stdin", "redirect"])))]
pub struct PutArgs {
    /// Key to insert under (e.g. CHK@, KSK@name, SSK@…/site).
    uri: String,

    /// Let the node read the data from this local file.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Send standard input as the data.
    #[arg(long)]
    stdin: bool,

    /// Insert a redirect to this key.
    #[arg(long)]
    redirect: Option<String>,

    /// Filename stored with the data.
    #[arg(long)]
    target_filename: Option<String>,
}

impl PutArgs {
    /// Launches the insert and prints the resulting key.
    pub async fn run(self, client: &Client) -> Result<()> {
        let mut put = client.put();
        if let Some(path) = self.file {
            put = put.from_file(path);
        }
        if let Some(target) = self.redirect {
            put = put.redirect_to(target);
        }
        if self.stdin {
            let mut data = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("failed to read standard input")?;
            put = put.from_bytes(data);
        }
        if let Some(name) = self.target_filename {
            put = put.named(name);
        }

        match put.launch(&self.uri)?.await? {
            Some(key) => {
                println!("{key}");
                Ok(())
            }
            None => bail!("upload failed"),
        }
    }
}
