use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_READ_BUFFER_SIZE;

mod receive;
mod send;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send every file under a directory to a receiving host
    ///
    /// Connects to the host given by -a on the port given by -p, then sends
    /// all files found recursively in the working directory (-d). Once done
    /// the receiver is told the list is complete and the connection closes.
    Send {
        /// Host to connect to
        #[arg(short = 'a', long)]
        host: String,
        /// Port to connect to
        #[arg(short, long)]
        port: u16,
        /// Directory to copy files from
        #[arg(short = 'd', long = "working-dir", default_value = ".")]
        working_dir: PathBuf,
        /// How many files to transfer concurrently
        #[arg(short, long, default_value_t = 1)]
        threads: u16,
        /// Bytes read from a file per chunk
        #[arg(short, long = "buffer-size", default_value_t = DEFAULT_READ_BUFFER_SIZE)]
        buffer_size: usize,
    },
    /// Accept copies from senders and write them beneath a directory
    Receive {
        /// Port to listen on
        #[arg(short, long)]
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Directory to write received files into
        #[arg(short = 'd', long = "working-dir", default_value = ".")]
        working_dir: PathBuf,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Send {
                host,
                port,
                working_dir,
                threads,
                buffer_size,
            } => send::run(host, port, working_dir, threads, buffer_size).await?,
            Commands::Receive {
                port,
                bind,
                working_dir,
            } => receive::run(bind, port, working_dir).await?,
        }
        Ok(())
    }
}
