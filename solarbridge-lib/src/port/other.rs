use super::{OpenPortError, Rs485, SerialStream};
use anyhow::Result;

// TODO: implement a busy check based on lsof for macOS
pub fn is_port_open(_port_name: &str) -> bool {
    false
}

impl Rs485 for SerialStream {
    fn rs485_is_enabled(&self) -> Result<bool> {
        Err(OpenPortError::Rs485Error {
            port_name: String::from("serial port"),
        }
        .into())
    }

    fn rs485_enable(&self, _enable: bool) -> Result<()> {
        Err(OpenPortError::Rs485Error {
            port_name: String::from("serial port"),
        }
        .into())
    }
}
