use std::{io, process, time::Duration};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells::Bash};
use env_logger::TimestampPrecision;
use log::{error, info};

use solarbridge_lib::device::{Device, Timing};
use solarbridge_lib::port;
use solarbridge_lib::protocol::ProtocolKind;
use solarbridge_lib::regs::{RegNames, Registry};
use solarbridge_lib::server::{ServerConfig, TelemetryServer};

/// Serve solar charger / inverter telemetry as JSON over TCP
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Serial device or 'auto'
    device: String,

    /// TCP port to listen on
    port: u16,

    /// Device protocol (telegram or vedirect)
    #[clap(long, short = 'P', default_value = "vedirect")]
    protocol: ProtocolKind,

    /// Comma separated registers to serve [default: protocol's standard set]
    #[clap(long, short)]
    registers: Option<RegNames>,

    /// Clients served at once
    #[clap(long, short, default_value_t = 16)]
    max_connections: usize,

    /// Response timeout in ms [default: 200 for telegram, 1000 for vedirect]
    #[clap(long, short)]
    timeout: Option<u64>,

    /// Address to listen on
    #[clap(long, short, default_value = "0.0.0.0")]
    bind: String,

    /// Skip sanity checks
    #[clap(long, short)]
    force: bool,

    /// enable debug output
    #[clap(long, short)]
    debug: bool,
}

async fn run(args: Args) -> Result<()> {
    let registry = Registry::new(args.protocol);
    let regs = match &args.registers {
        Some(names) => registry.select(&names[..])?,
        None => registry.default_subset(),
    };

    let timeout = args
        .timeout
        .map(|ms| Timing::uniform(Duration::from_millis(ms)))
        .unwrap_or_default()
        .for_kind(args.protocol);

    let port = port::open_port(&args.device, args.protocol, args.force)
        .with_context(|| format!("cannot open device {}", args.device))?;
    let (device, _worker) = Device::spawn(args.protocol, port, timeout);

    let mut config = ServerConfig::new(format!("{}:{}", args.bind, args.port));
    config.max_connections = args.max_connections;

    info!(
        "{} on {}: {}",
        args.protocol,
        args.device,
        regs.iter().map(|reg| reg.name).collect::<Vec<_>>().join(",")
    );
    TelemetryServer::new(device, regs, config).run().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(Bash, &mut Args::command(), "solarbridge", &mut io::stdout());
        return;
    }

    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if args.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(Some(TimestampPrecision::Millis))
    .format_target(false)
    .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}
