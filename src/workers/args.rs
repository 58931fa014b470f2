//! Command-line argument parsing.
//!
//! One binary, three workers: the signaling broker and the two transfer
//! roles. Broker host/port and the client's broker URL fall back to
//! environment variables so deployments need no flags.

use crate::core::config::{DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT, DEFAULT_CHUNK_SIZE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fluxdrop - peer-to-peer file transfer through a rendezvous broker.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the signaling broker.
    Broker {
        /// Address to listen on.
        #[clap(long, env = "FLUXDROP_HOST", default_value = DEFAULT_BROKER_HOST)]
        host: String,

        /// Port to listen on.
        #[clap(long, env = "FLUXDROP_PORT", default_value_t = DEFAULT_BROKER_PORT)]
        port: u16,
    },
    /// Send files to the peer waiting behind a code.
    Send {
        /// Broker URL.
        #[clap(long, env = "FLUXDROP_BROKER", default_value = "ws://127.0.0.1:8765")]
        broker: String,

        /// Rendezvous code shown by the receiver.
        #[clap(long)]
        code: String,

        /// Disable per-chunk compression.
        #[clap(long)]
        no_compression: bool,

        /// Bytes per chunk before compression.
        #[clap(long, default_value_t = DEFAULT_CHUNK_SIZE as u64, value_parser = clap::value_parser!(u64).range(1..))]
        chunk_size: u64,

        /// Files to send, in order.
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
    /// Wait for a sender: mints a code, prints it, receives files.
    Receive {
        /// Broker URL.
        #[clap(long, env = "FLUXDROP_BROKER", default_value = "ws://127.0.0.1:8765")]
        broker: String,

        /// Directory received files are written into.
        #[clap(short, long, default_value = ".")]
        output: PathBuf,
    },
}

impl Args {
    pub fn load() -> Self {
        Args::parse()
    }
}
