use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

use super::{discard_input, Protocol, ProtocolError, ProtocolKind, Result};
use crate::port::Transport;
use crate::regs::{Address, Reg, RegSize, Telegram};

/// Upper bound on a reply; anything longer is line noise.
pub const MAX_FRAME: usize = 256;

const EXCEPTION_FLAG: u8 = 0x80;

/// The first reply byte may take this many silence periods to show up.
const FIRST_BYTE_SILENCES: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Function {
    ReadCoils = 0x01,
    ReadInputRegisters = 0x04,
    ReadExtended = 0x43,
}

impl Function {
    /// Bytes ahead of the payload. Extended replies add a register-valid mask.
    pub fn header_len(self) -> usize {
        match self {
            Function::ReadExtended => 4,
            Function::ReadCoils | Function::ReadInputRegisters => 3,
        }
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    let crc = Crc::<u16>::new(&CRC_16_MODBUS);
    crc.checksum(data)
}

/// Checks the little-endian CRC trailing `frame`.
pub fn check_crc(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame.len() < 3 {
        return Err(ProtocolError::ShortFrame {
            expected: 3,
            got: frame.len(),
        });
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let computed = crc16(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if computed != received {
        return Err(ProtocolError::BadCrc { computed, received });
    }
    Ok(())
}

/// Length the reply announces once its header has arrived.
pub fn declared_len(frame: &[u8]) -> Option<usize> {
    if frame.len() < 3 {
        return None;
    }
    if frame[1] & EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    Function::from_u8(frame[1]).map(|function| function.header_len() + frame[2] as usize + 2)
}

/// Validates a reply to `telegram` and returns it without trailing noise.
pub fn validate_reply<'f>(telegram: &Telegram, frame: &'f [u8]) -> Result<&'f [u8], ProtocolError> {
    if frame.len() < 3 {
        return Err(ProtocolError::ShortFrame {
            expected: 3,
            got: frame.len(),
        });
    }

    if frame[1] == telegram.reply_header[1] | EXCEPTION_FLAG {
        if frame.len() < 5 {
            return Err(ProtocolError::ShortFrame {
                expected: 5,
                got: frame.len(),
            });
        }
        check_crc(&frame[..5])?;
        return Err(ProtocolError::Exception(frame[2]));
    }

    if frame[..3] != telegram.reply_header {
        return Err(ProtocolError::BadHeader(frame[..3].to_vec()));
    }

    let expected = declared_len(frame).ok_or_else(|| ProtocolError::BadHeader(frame[..3].to_vec()))?;
    if frame.len() < expected {
        return Err(ProtocolError::ShortFrame {
            expected,
            got: frame.len(),
        });
    }

    let frame = &frame[..expected];
    check_crc(frame)?;
    Ok(frame)
}

/// Big-endian field of `size` bytes at `offset`.
pub fn field(frame: &[u8], offset: usize, size: RegSize) -> Result<u32, ProtocolError> {
    let end = offset + size as usize;
    let bytes = frame.get(offset..end).ok_or(ProtocolError::ShortFrame {
        expected: end,
        got: frame.len(),
    })?;
    Ok(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

pub struct ProtocolTelegram<'a, T> {
    port: &'a mut T,
    silence: Duration,
    cache: Option<(&'static str, Vec<u8>)>,
    buf: [u8; MAX_FRAME],
}

impl<'a, T: Transport> ProtocolTelegram<'a, T> {
    pub fn new(port: &'a mut T, silence: Duration) -> Self {
        Self {
            port,
            silence,
            cache: None,
            buf: [0u8; MAX_FRAME],
        }
    }

    /// Sends the request and collects the reply until the line goes quiet,
    /// the declared length has arrived, or the frame cap is hit. The device
    /// gets `FIRST_BYTE_SILENCES` silence periods to start answering.
    pub async fn exchange(&mut self, telegram: &Telegram) -> Result<Vec<u8>> {
        check_crc(&telegram.request)?;
        discard_input(&mut *self.port, &mut self.buf).await?;

        debug!("{} send {:02X?}", telegram.name, telegram.request);
        self.port.write_all(&telegram.request).await?;
        self.port.flush().await?;

        let mut frame: Vec<u8> = Vec::with_capacity(64);
        while frame.len() < MAX_FRAME {
            let room = MAX_FRAME - frame.len();
            let wait = if frame.is_empty() {
                self.silence * FIRST_BYTE_SILENCES
            } else {
                self.silence
            };
            match timeout(wait, self.port.read(&mut self.buf[..room])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => frame.extend_from_slice(&self.buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
            if matches!(declared_len(&frame), Some(len) if frame.len() >= len) {
                break;
            }
        }
        debug!("{} recv {:02X?}", telegram.name, frame);

        if frame.is_empty() {
            return Err(ProtocolError::TimedOut.into());
        }
        Ok(validate_reply(telegram, &frame)?.to_vec())
    }
}

#[async_trait]
impl<'a, T: Transport> Protocol for ProtocolTelegram<'a, T> {
    async fn read_raw(&mut self, reg: &Reg) -> Result<u32> {
        let (telegram, offset) = match reg.address {
            Address::Telegram { telegram, offset } => (telegram, offset),
            Address::Hex(_) => return Err(ProtocolError::InvalidAddress(reg.name).into()),
        };

        let frame = match self.cache.take() {
            Some((name, frame)) if name == telegram.name => frame,
            _ => self.exchange(telegram).await?,
        };
        let value = field(&frame, offset, reg.size);
        self.cache = Some((telegram.name, frame));
        Ok(value?)
    }

    fn start_cycle(&mut self) {
        self.cache = None;
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Telegram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{Registry, Value};
    use tokio::io::duplex;

    fn reply(header: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut frame = header.to_vec();
        frame.extend_from_slice(payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn electric_reply() -> Vec<u8> {
        reply(
            [0x03, 0x43, 0x10, 0xFF],
            &[
                0x0A, 0x28, // battery 26.00 V
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x59, 0xD8, // output 230.00 V
                0x00, 0x91, // 1.45 A
                0x01, 0x4D, // 3.33 W
                0x00, 0x00,
            ],
        )
    }

    fn telegram(name: &str) -> &'static Telegram {
        Registry::new(ProtocolKind::Telegram)
            .telegrams()
            .into_iter()
            .find(|t| t.name == name)
            .unwrap()
    }

    #[test]
    fn request_templates_carry_valid_crc() {
        let telegrams = Registry::new(ProtocolKind::Telegram).telegrams();
        assert_eq!(telegrams.len(), 3);
        for t in telegrams {
            assert_eq!(check_crc(&t.request), Ok(()), "{}", t.name);
            assert_eq!(t.request[..2], t.reply_header[..2]);
        }
    }

    #[test]
    fn crc_matches_plain_modbus_reply() {
        assert_eq!(check_crc(&[0x03, 0x04, 0x02, 0x00, 0x01, 0x01, 0x30]), Ok(()));
        assert_eq!(declared_len(&[0x03, 0x04, 0x02]), Some(7));
    }

    #[test]
    fn validate_good_reply_and_trim_noise() {
        let t = telegram("getElectricParameters");
        let mut frame = electric_reply();
        assert_eq!(frame.len(), 22);
        frame.extend_from_slice(&[0x00, 0xFF]);
        assert_eq!(validate_reply(t, &frame).unwrap(), &electric_reply()[..]);
    }

    #[test]
    fn validate_rejects_bad_frames() {
        let t = telegram("getElectricParameters");
        let frame = electric_reply();

        assert_eq!(
            validate_reply(t, &frame[..15]),
            Err(ProtocolError::ShortFrame {
                expected: 22,
                got: 15
            })
        );

        let mut corrupted = frame.clone();
        corrupted[5] ^= 0x01;
        assert!(matches!(
            validate_reply(t, &corrupted),
            Err(ProtocolError::BadCrc { .. })
        ));

        let other = telegram("getTemperatures");
        assert_eq!(
            validate_reply(other, &frame),
            Err(ProtocolError::BadHeader(vec![0x03, 0x43, 0x10]))
        );

        let mut exception = vec![0x03, 0xC3, 0x02];
        let crc = crc16(&exception);
        exception.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(validate_reply(t, &exception), Err(ProtocolError::Exception(0x02)));

        assert_eq!(
            validate_reply(t, &exception[..4]),
            Err(ProtocolError::ShortFrame {
                expected: 5,
                got: 4
            })
        );
    }

    #[test]
    fn big_endian_fields() {
        let frame = electric_reply();
        assert_eq!(field(&frame, 4, RegSize::Half), Ok(2600));
        assert_eq!(field(&frame, 12, RegSize::Half), Ok(23000));
        assert_eq!(field(&frame, 4, RegSize::Byte), Ok(0x0A));
        assert_eq!(
            field(&frame, 21, RegSize::Half),
            Err(ProtocolError::ShortFrame {
                expected: 23,
                got: 22
            })
        );
    }

    #[tokio::test]
    async fn electric_parameters_from_mocked_device() {
        let (mut near, mut far) = duplex(256);
        let device = tokio::spawn(async move {
            let mut requests = Vec::new();
            let mut request = [0u8; 8];
            while far.read_exact(&mut request).await.is_ok() {
                requests.push(request);
                far.write_all(&electric_reply()).await.unwrap();
            }
            requests
        });

        let registry = Registry::new(ProtocolKind::Telegram);
        let regs = registry
            .select(&["battVoltage", "outVoltage", "outCurrent", "outPower"])
            .unwrap();
        {
            let mut proto = ProtocolTelegram::new(&mut near, Duration::from_millis(100));
            proto.start_cycle();
            let mut values = Vec::new();
            for reg in &regs {
                values.push(reg.decode(proto.read_raw(reg).await.unwrap()));
            }
            assert_eq!(
                values,
                vec![
                    Value::Scaled(26.0),
                    Value::Scaled(230.0),
                    Value::Scaled(1.45),
                    Value::Scaled(3.33)
                ]
            );
        }
        drop(near);

        let requests = device.await.unwrap();
        assert_eq!(requests, vec![telegram("getElectricParameters").request]);
    }

    #[tokio::test]
    async fn thresholds_from_mocked_device() {
        let (mut near, mut far) = duplex(256);
        let device = tokio::spawn(async move {
            let mut request = [0u8; 8];
            far.read_exact(&mut request).await.unwrap();
            far.write_all(&reply(
                [0x03, 0x43, 0x08, 0x0F],
                &[0x04, 0xB0, 0x05, 0x14, 0x05, 0xDC, 0x06, 0x40],
            ))
            .await
            .unwrap();
            request
        });

        let regs = Registry::new(ProtocolKind::Telegram)
            .select(&[
                "underVoltageThreshold",
                "underVoltageRecovery",
                "overVoltageRecovery",
                "overVoltageThreshold",
            ])
            .unwrap();
        let mut proto = ProtocolTelegram::new(&mut near, Duration::from_millis(100));
        proto.start_cycle();
        let mut values = Vec::new();
        for reg in &regs {
            values.push(reg.decode(proto.read_raw(reg).await.unwrap()));
        }
        assert_eq!(
            values,
            vec![
                Value::Scaled(12.0),
                Value::Scaled(13.0),
                Value::Scaled(15.0),
                Value::Scaled(16.0)
            ]
        );
        assert_eq!(device.await.unwrap(), telegram("getThresholds").request);
    }

    #[tokio::test]
    async fn slow_first_byte_is_awaited() {
        let (mut near, mut far) = duplex(256);
        tokio::spawn(async move {
            let mut request = [0u8; 8];
            far.read_exact(&mut request).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            far.write_all(&electric_reply()).await.unwrap();
            far
        });

        let reg = *Registry::new(ProtocolKind::Telegram).find("battVoltage").unwrap();
        let mut proto = ProtocolTelegram::new(&mut near, Duration::from_millis(50));
        assert_eq!(proto.read_raw(&reg).await.unwrap(), 2600);
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (mut near, _far) = duplex(256);
        let reg = *Registry::new(ProtocolKind::Telegram).find("temperature").unwrap();
        let mut proto = ProtocolTelegram::new(&mut near, Duration::from_millis(20));
        let err = proto.read_raw(&reg).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::TimedOut)
        );
    }

    #[tokio::test]
    async fn hex_register_is_rejected() {
        let (mut near, _far) = duplex(256);
        let reg = *Registry::new(ProtocolKind::VeDirect).find("panelPower").unwrap();
        let mut proto = ProtocolTelegram::new(&mut near, Duration::from_millis(20));
        assert!(proto.read_raw(&reg).await.is_err());
    }
}
