pub mod cli;

use std::{io, process, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells::Bash};
use json::JsonValue;
use log::{error, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use solarbridge_lib::device::{PollResult, Timing};
use solarbridge_lib::port;
use solarbridge_lib::protocol::{make_protocol, Protocol, ProtocolKind};
use solarbridge_lib::regs::{Reg, Registry, Value};

use cli::{Cli, Commands};

enum OutputFormat {
    Plain,
    Json,
}

fn slice_to_column<T>(data: &[T]) -> String
where
    T: std::fmt::Display,
{
    data.iter()
        .map(|x| x.to_string())
        .collect::<Vec<String>>()
        .join("\n")
}

fn cmd_list_registers(kind: ProtocolKind, fmt: OutputFormat) -> Result<String> {
    let registry = Registry::new(kind);
    match fmt {
        OutputFormat::Plain => Ok(slice_to_column(&registry.iter().collect::<Vec<_>>())),
        OutputFormat::Json => {
            let mut list = JsonValue::new_array();
            for reg in registry.iter() {
                let mut entry = JsonValue::new_object();
                entry.insert("name", reg.name)?;
                entry.insert("address", reg.address.to_string())?;
                entry.insert("size", reg.size as u8)?;
                entry.insert("scale", reg.scale)?;
                entry.insert("unit", reg.unit)?;
                list.push(entry)?;
            }
            Ok(json::stringify(list))
        }
    }
}

async fn cmd_query(proto: &mut dyn Protocol, regs: &[Reg], fmt: OutputFormat) -> Result<String> {
    proto.start_cycle();
    let mut result = PollResult::default();
    let mut lines = Vec::new();
    for reg in regs {
        let decoded = match proto.read_raw(reg).await {
            Ok(raw) => reg.decode_text(raw).map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                warn!("{}: {:#}", reg.name, e);
                Value::Failed
            }
        };
        result.insert(reg.name, value);
        lines.push(match value {
            Value::Failed | Value::Label(_) => format!("{}: {}", reg.name, value),
            _ => format!("{}: {} {}", reg.name, value, reg.unit).trim_end().to_string(),
        });
    }

    Ok(match fmt {
        OutputFormat::Plain => lines.join("\n"),
        OutputFormat::Json => json::stringify(result.to_json()),
    })
}

async fn cmd_read(server: &str, fmt: OutputFormat) -> Result<String> {
    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("cannot connect to {}", server))?;
    stream.write_all(b"read").await?;
    stream.shutdown().await?;

    let mut body = String::new();
    stream
        .read_to_string(&mut body)
        .await
        .context("failed to receive snapshot")?;
    let snapshot = json::parse(&body).with_context(|| format!("bad reply {:?}", body))?;
    if !snapshot.is_object() {
        return Err(anyhow!("bad reply {:?}", body));
    }

    Ok(match fmt {
        OutputFormat::Plain => snapshot
            .entries()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => body,
    })
}

async fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut Cli::command(),
            "solarbridge-tool",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    match cli.command {
        Commands::ListRegisters => cmd_list_registers(cli.protocol, fmt),
        Commands::Read { server } => cmd_read(&server, fmt).await,
        Commands::Query { device, regs } => {
            let registry = Registry::new(cli.protocol);
            let regs = if regs.is_empty() {
                registry.default_subset()
            } else {
                registry.select(&regs[..])?
            };
            let timeout = cli
                .timeout
                .map(|ms| Timing::uniform(Duration::from_millis(ms)))
                .unwrap_or_default()
                .for_kind(cli.protocol);

            let mut port = port::open_port(&device, cli.protocol, cli.force)?;
            let mut proto_box = make_protocol(cli.protocol, &mut port, timeout);
            cmd_query(proto_box.as_mut(), &regs, fmt).await
        }
    }
}

#[tokio::main]
async fn main() {
    match do_main().await {
        Ok(s) if s.is_empty() => {}
        Ok(s) => println!("{}", s),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}
