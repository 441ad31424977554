use async_trait::async_trait;
use log::debug;
use std::{io, mem, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

use super::{discard_input, Protocol, ProtocolError, ProtocolKind, Result};
use crate::port::Transport;
use crate::regs::{Address, Reg, RegSize};

/// Command nibble of a "get register" request and of its reply.
pub const COMMAND_GET: u8 = 0x7;

/// Longest line kept while hunting for a reply; VE.Direct text blocks can be
/// interleaved with HEX frames.
const MAX_LINE: usize = 128;

/// Byte completing `sum` to 0x55 modulo 0x100.
pub fn checksum(sum: u32) -> u8 {
    let cs = if sum < 0x55 {
        0x55 - sum
    } else if sum < 0x155 {
        0x155 - sum
    } else if sum < 0x255 {
        0x255 - sum
    } else {
        0x355u32.wrapping_sub(sum) & 0xFF
    };
    cs as u8
}

/// True when command nibble, payload and trailing checksum add up to 0x55.
pub fn is_valid(command: u8, bytes: &[u8]) -> bool {
    frame_sum(command, bytes) == 0x55
}

fn frame_sum(command: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(command, |acc, &b| acc.wrapping_add(b))
}

/// Renders `:` + command nibble + hex payload + checksum + newline.
pub fn encode_frame(command: u8, payload: &[u8]) -> String {
    let sum = command as u32 + payload.iter().map(|&b| b as u32).sum::<u32>();
    format!(
        ":{:X}{}{:02X}\n",
        command,
        hex::encode_upper(payload),
        checksum(sum)
    )
}

/// Get request for register `id`: id low byte, id high byte, flags 0.
pub fn encode_get(id: u16) -> String {
    let [lo, hi] = id.to_le_bytes();
    encode_frame(COMMAND_GET, &[lo, hi, 0x00])
}

/// Picks get replies out of a byte stream shared with other frame types.
#[derive(Debug, Default)]
pub struct FrameSync {
    line: Vec<u8>,
    started: bool,
}

impl FrameSync {
    /// Feeds one byte. Returns a complete get reply without its `:` and
    /// newline; other frame types are dropped.
    pub fn push(&mut self, b: u8) -> Option<Vec<u8>> {
        match b {
            b':' => {
                self.started = true;
                self.line.clear();
                None
            }
            b'\n' if self.started => {
                self.started = false;
                let line = mem::take(&mut self.line);
                if line.first() == Some(&b'7') {
                    Some(line)
                } else {
                    debug!("skipping frame {:?}", String::from_utf8_lossy(&line));
                    None
                }
            }
            _ if self.started => {
                if self.line.len() < MAX_LINE {
                    self.line.push(b);
                } else {
                    debug!("dropping overlong frame");
                    self.started = false;
                    self.line.clear();
                }
                None
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReply {
    pub id: u16,
    pub flags: u8,
    pub value: Vec<u8>,
}

/// Decodes `7<id lo><id hi><flags><value...><checksum>` as produced by
/// [`FrameSync::push`].
pub fn decode_reply(line: &[u8]) -> Result<GetReply, ProtocolError> {
    let bad_packet = || ProtocolError::BadPacket(String::from_utf8_lossy(line).into_owned());

    let text = line.get(1..).ok_or_else(bad_packet)?;
    let bytes = hex::decode(text).map_err(|_| bad_packet())?;
    if bytes.len() < 4 {
        return Err(ProtocolError::ShortFrame {
            expected: 4,
            got: bytes.len(),
        });
    }
    if !is_valid(COMMAND_GET, &bytes) {
        return Err(ProtocolError::BadChecksum(frame_sum(COMMAND_GET, &bytes)));
    }

    Ok(GetReply {
        id: u16::from_le_bytes([bytes[0], bytes[1]]),
        flags: bytes[2],
        value: bytes[3..bytes.len() - 1].to_vec(),
    })
}

fn u16_le(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8
}

/// Extracts the little-endian value of a successful reply.
pub fn value(reply: &GetReply, size: RegSize) -> Result<u32, ProtocolError> {
    if reply.flags != 0 {
        return Err(ProtocolError::StatusError(reply.flags));
    }
    let v = &reply.value;
    if v.len() < size as usize {
        return Err(ProtocolError::ShortFrame {
            expected: size as usize,
            got: v.len(),
        });
    }
    Ok(match size {
        RegSize::Byte => v[0] as u32,
        RegSize::Half => u16_le(&v[0..2]),
        RegSize::Word => u16_le(&v[0..2]) | u16_le(&v[2..4]) << 16,
    })
}

pub struct ProtocolVeDirect<'a, T> {
    port: &'a mut T,
    deadline: Duration,
    buf: [u8; 64],
}

impl<'a, T: Transport> ProtocolVeDirect<'a, T> {
    pub fn new(port: &'a mut T, deadline: Duration) -> Self {
        Self {
            port,
            deadline,
            buf: [0u8; 64],
        }
    }

    pub async fn get(&mut self, id: u16) -> Result<GetReply> {
        discard_input(&mut *self.port, &mut self.buf).await?;

        let request = encode_get(id);
        debug!("send {:?}", request.trim_end());
        self.port.write_all(request.as_bytes()).await?;
        self.port.flush().await?;

        match timeout(self.deadline, self.await_reply(id)).await {
            Ok(res) => res,
            Err(_) => Err(ProtocolError::TimedOut.into()),
        }
    }

    async fn await_reply(&mut self, id: u16) -> Result<GetReply> {
        let mut sync = FrameSync::default();
        loop {
            let n = self.port.read(&mut self.buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial line closed").into());
            }
            for &b in &self.buf[..n] {
                if let Some(line) = sync.push(b) {
                    debug!("recv {:?}", String::from_utf8_lossy(&line));
                    let reply = decode_reply(&line)?;
                    if reply.id == id {
                        return Ok(reply);
                    }
                    debug!("skipping reply for register {:#06x}", reply.id);
                }
            }
        }
    }
}

#[async_trait]
impl<'a, T: Transport> Protocol for ProtocolVeDirect<'a, T> {
    async fn read_raw(&mut self, reg: &Reg) -> Result<u32> {
        let id = match reg.address {
            Address::Hex(id) => id,
            Address::Telegram { .. } => return Err(ProtocolError::InvalidAddress(reg.name).into()),
        };
        let reply = self.get(id).await?;
        Ok(value(&reply, reg.size)?)
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::VeDirect
    }
}
