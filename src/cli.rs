use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[command(name = "audioworker")]
#[command(about = "Remote-controllable audio exerciser")]
pub struct Cli {
    /// Keep config and data under this directory instead of the OS locations.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the controller tree over TCP until Ctrl-C.
    Serve {
        /// Override `transport.listen_port` from the config.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Execute one wire function locally and print its Acks.
    Exec {
        /// Function JSON, e.g. '{"class":"RecordInfoFunction"}'.
        function: String,

        /// How long to keep printing Acks.
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },

    /// Submit one wire function to a serving peer and print the correlated Acks.
    Send {
        /// Peer address, host:port.
        addr: String,

        /// Function JSON.
        function: String,

        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
}
