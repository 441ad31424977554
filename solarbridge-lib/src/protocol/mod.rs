pub mod telegram;
pub mod vedirect;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::{fmt::Display, str::FromStr, time::Duration};
use thiserror::Error;
use tokio::{io::AsyncReadExt, time::timeout};
use tokio_serial::StopBits;

use crate::port::Transport;
use crate::regs::Reg;

use telegram::ProtocolTelegram;
use vedirect::ProtocolVeDirect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Binary RS485 telegrams (inverter)
    Telegram,
    /// VE.Direct ASCII-hex frames (charge controller)
    VeDirect,
}

impl ProtocolKind {
    pub fn baudrate(self) -> u32 {
        match self {
            ProtocolKind::Telegram => 115200,
            ProtocolKind::VeDirect => 19200,
        }
    }

    pub fn stop_bits(self) -> StopBits {
        match self {
            ProtocolKind::Telegram => StopBits::Two,
            ProtocolKind::VeDirect => StopBits::One,
        }
    }

    /// Inter-byte silence ending a telegram reply (the first byte may take
    /// five times as long), or the overall deadline for a VE.Direct reply.
    pub fn default_timeout(self) -> Duration {
        match self {
            ProtocolKind::Telegram => Duration::from_millis(200),
            ProtocolKind::VeDirect => Duration::from_millis(1000),
        }
    }
}

impl Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Telegram => "telegram".fmt(f),
            ProtocolKind::VeDirect => "vedirect".fmt(f),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolKindError {
    #[error("invalid protocol '{0}'")]
    BadProtocol(String),
}

impl FromStr for ProtocolKind {
    type Err = ProtocolKindError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "telegram" | "rs485" => Ok(ProtocolKind::Telegram),
            "vedirect" | "ve.direct" => Ok(ProtocolKind::VeDirect),
            _ => Err(ProtocolKindError::BadProtocol(input.to_string())),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no reply before timeout")]
    TimedOut,
    #[error("short frame: expected {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },
    #[error("unexpected reply header {0:02X?}")]
    BadHeader(Vec<u8>),
    #[error("crc mismatch: computed {computed:04X}, received {received:04X}")]
    BadCrc { computed: u16, received: u16 },
    #[error("checksum mismatch, frame sums to {0:#04x}")]
    BadChecksum(u8),
    #[error("corrupted frame {0:?}")]
    BadPacket(String),
    #[error("device exception {0:#04x}")]
    Exception(u8),
    #[error("device flags {0:#04x}")]
    StatusError(u8),
    #[error("register {0} is not addressable with this protocol")]
    InvalidAddress(&'static str),
}

#[async_trait]
pub trait Protocol: Send {
    /// Reads the unscaled integer behind `reg`.
    async fn read_raw(&mut self, reg: &Reg) -> Result<u32>;

    /// Marks the start of a poll cycle; nothing read earlier may be reused.
    fn start_cycle(&mut self) {}

    fn kind(&self) -> ProtocolKind;
}

pub fn make_protocol<'a, T: Transport + 'a>(
    kind: ProtocolKind,
    port: &'a mut T,
    timeout: Duration,
) -> Box<dyn Protocol + 'a> {
    match kind {
        ProtocolKind::Telegram => Box::new(ProtocolTelegram::new(port, timeout)),
        ProtocolKind::VeDirect => Box::new(ProtocolVeDirect::new(port, timeout)),
    }
}

/// Throws away whatever the device sent since the last exchange.
async fn discard_input<T: Transport>(port: &mut T, buf: &mut [u8]) -> Result<()> {
    let mut discarded = 0;
    while let Ok(res) = timeout(Duration::ZERO, port.read(buf)).await {
        match res? {
            0 => break,
            n => discarded += n,
        }
    }
    if discarded > 0 {
        debug!("discarded {} stale bytes", discarded);
    }
    Ok(())
}
