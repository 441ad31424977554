use clap::{Parser, Subcommand};

use solarbridge_lib::protocol::ProtocolKind;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    /// Response timeout in ms [default: depends on protocol]
    #[clap(long, short)]
    pub timeout: Option<u64>,

    /// Device protocol (telegram or vedirect)
    #[clap(long, short = 'P', default_value = "vedirect")]
    pub protocol: ProtocolKind,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registers known for the protocol
    #[clap(visible_alias = "ls")]
    ListRegisters,

    /// Read registers straight from a serial device
    Query {
        /// Serial device or 'auto'
        device: String,
        /// Register names [default: protocol's standard set]
        regs: Vec<String>,
    },

    /// Fetch one snapshot from a running server
    Read {
        /// HOST:PORT of the server
        server: String,
    },
}
