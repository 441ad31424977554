#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod other;

#[cfg(target_os = "linux")]
use linux::is_port_open;
#[cfg(not(target_os = "linux"))]
use other::is_port_open;

pub use tokio_serial::SerialStream;

use anyhow::{Context, Result};
use log::debug;
use serialport::SerialPortType;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt};

use crate::protocol::ProtocolKind;

/// Anything a protocol can talk through: a serial port, or one end of an
/// in-memory pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("no compatible serial adapter found")]
    NoCompatiblePort,
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
    #[error("rs485 configuration failed on {port_name:?}")]
    Rs485Error { port_name: String },
}

trait Rs485 {
    fn rs485_is_enabled(&self) -> Result<bool>;
    fn rs485_enable(&self, enable: bool) -> Result<()>;

    fn rs485_is_supported(&self) -> bool {
        match self.rs485_is_enabled() {
            Ok(enabled) => self.rs485_enable(enabled).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(PartialEq)]
struct UsbId(u16, u16);

static COMPATIBLE_IDS: &[UsbId] = &[
    UsbId(0x0403, 0x6015), // FTDI FT-X, Victron VE.Direct USB cable
    UsbId(0x0403, 0x6001), // FTDI FT232R USB-RS485 converter
    UsbId(0x1a86, 0x7523), // QinHeng Electronics HL-340 USB-Serial adapter
    UsbId(0x10c4, 0xea60), // Silicon Labs CP210x USB-UART bridge
];

/// Opens `port_name` (or the first known adapter for "auto") with the line
/// settings `kind` requires.
pub fn open_port(port_name: &str, kind: ProtocolKind, force: bool) -> Result<SerialStream> {
    let true_name: String = if port_name == "auto" {
        guess_port()?
    } else {
        port_name.to_string()
    };

    if !force && is_port_open(&true_name) {
        return Err(OpenPortError::PortBusy {
            port_name: true_name,
        }
        .into());
    }

    let port = tokio_serial::new(&true_name, kind.baudrate())
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(kind.stop_bits())
        .flow_control(FlowControl::None)
        .open_native_async()
        .with_context(|| format!("failed to open {}", true_name))?;

    if kind == ProtocolKind::Telegram
        && port.rs485_is_supported()
        && port.rs485_enable(true).is_err()
        && !force
    {
        return Err(OpenPortError::Rs485Error {
            port_name: true_name,
        }
        .into());
    }

    debug!(
        "open_port OK: {} @ {} baud, {:?} stop bits",
        &true_name,
        kind.baudrate(),
        kind.stop_bits()
    );
    Ok(port)
}

fn guess_port() -> Result<String> {
    serialport::available_ports()?
        .into_iter()
        .filter(|info| match &info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                COMPATIBLE_IDS.contains(&UsbId(usb_info.vid, usb_info.pid))
                    && !is_port_open(&info.port_name)
            }
            _ => false,
        })
        .map(|info| info.port_name)
        .next()
        .ok_or_else(|| OpenPortError::NoCompatiblePort.into())
}
