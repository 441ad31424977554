mod db;

use itertools::Itertools;
use json::JsonValue;
use lazy_static::lazy_static;
use regex::Regex;
use std::{fmt::Display, ops::Deref, str::FromStr};
use thiserror::Error;

use crate::protocol::ProtocolKind;

/// Reported in place of a register that could not be read.
pub const SENTINEL: i64 = -65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegSize {
    Byte = 1,
    Half = 2,
    Word = 4,
}

/// A binary telegram request with its CRC already appended, and the
/// address/function/byte-count header a well-formed reply starts with.
#[derive(Debug, PartialEq, Eq)]
pub struct Telegram {
    pub name: &'static str,
    pub request: [u8; 8],
    pub reply_header: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// VE.Direct register id
    Hex(u16),
    /// Field at `offset` bytes into the reply to `telegram`
    Telegram {
        telegram: &'static Telegram,
        offset: usize,
    },
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Hex(id) => write!(f, "0x{:04X}", id),
            Address::Telegram { telegram, offset } => write!(f, "{}@{}", telegram.name, offset),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reg {
    pub name: &'static str,
    pub address: Address,
    pub size: RegSize,
    /// Divisor for the raw integer; 0 keeps the raw integer
    pub scale: u32,
    pub signed: bool,
    pub unit: &'static str,
    pub codes: Option<&'static [(u32, &'static str)]>,
}

impl Reg {
    pub const fn hex(
        name: &'static str,
        id: u16,
        size: RegSize,
        scale: u32,
        unit: &'static str,
    ) -> Self {
        Reg {
            name,
            address: Address::Hex(id),
            size,
            scale,
            signed: false,
            unit,
            codes: None,
        }
    }

    pub const fn telegram(
        name: &'static str,
        telegram: &'static Telegram,
        offset: usize,
        scale: u32,
        unit: &'static str,
    ) -> Self {
        Reg {
            name,
            address: Address::Telegram { telegram, offset },
            size: RegSize::Half,
            scale,
            signed: false,
            unit,
            codes: None,
        }
    }

    pub const fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub const fn with_codes(mut self, codes: &'static [(u32, &'static str)]) -> Self {
        self.codes = Some(codes);
        self
    }

    fn extend(&self, raw: u32) -> i64 {
        if !self.signed {
            return raw as i64;
        }
        match self.size {
            RegSize::Byte => raw as u8 as i8 as i64,
            RegSize::Half => raw as u16 as i16 as i64,
            RegSize::Word => raw as i32 as i64,
        }
    }

    /// Turns the raw register contents into the value served to clients.
    pub fn decode(&self, raw: u32) -> Value {
        let raw = self.extend(raw);
        if self.scale > 0 {
            Value::Scaled(raw as f64 / self.scale as f64)
        } else {
            Value::Raw(raw)
        }
    }

    pub fn label(&self, raw: u32) -> Result<&'static str, RegError> {
        let codes = self.codes.ok_or(RegError::NoCodes(self.name))?;
        codes
            .iter()
            .find(|(code, _)| *code == raw)
            .map(|(_, label)| *label)
            .ok_or(RegError::UnknownCode {
                name: self.name,
                code: raw,
            })
    }

    /// Like [`Reg::decode`], but enumerated registers come back as labels.
    pub fn decode_text(&self, raw: u32) -> Result<Value, RegError> {
        match self.codes {
            Some(_) if self.scale == 0 => self.label(raw).map(Value::Label),
            _ => Ok(self.decode(raw)),
        }
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let address = self.address.to_string();
        write!(
            f,
            "{:<24} {:<1} {:>4} {:<4} {}",
            address, self.size as u8, self.scale, self.unit, self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Scaled(f64),
    Raw(i64),
    Label(&'static str),
    Failed,
}

impl Value {
    pub fn is_failed(&self) -> bool {
        matches!(self, Value::Failed)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Scaled(v) => v.fmt(f),
            Value::Raw(v) => v.fmt(f),
            Value::Label(s) => s.fmt(f),
            Value::Failed => "unreadable".fmt(f),
        }
    }
}

impl From<Value> for JsonValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Scaled(v) => v.into(),
            Value::Raw(v) => v.into(),
            Value::Label(s) => s.into(),
            Value::Failed => SENTINEL.into(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegError {
    #[error("no such register '{0}'")]
    NotFound(String),
    #[error("register {0} has no code table")]
    NoCodes(&'static str),
    #[error("register {name} reported unknown code {code}")]
    UnknownCode { name: &'static str, code: u32 },
    #[error("invalid register list '{0}'")]
    BadRegList(String),
}

/// Comma separated register names, as given on the command line.
#[derive(Debug, Clone)]
pub struct RegNames(Vec<String>);

impl Deref for RegNames {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for RegNames {
    type Err = RegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^[[:alpha:]][_[:alnum:]]*$").unwrap();
        }
        let names = s
            .split(',')
            .map(str::trim)
            .map(|name| {
                if RE.is_match(name) {
                    Ok(name.to_string())
                } else {
                    Err(RegError::BadRegList(s.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RegNames(names.into_iter().unique().collect()))
    }
}

/// Immutable register catalog of one protocol.
#[derive(Debug, Clone, Copy)]
pub struct Registry {
    regs: &'static [Reg],
    defaults: &'static [&'static str],
}

impl Registry {
    pub fn new(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Telegram => Registry {
                regs: db::TELEGRAM_REGS,
                defaults: db::TELEGRAM_DEFAULTS,
            },
            ProtocolKind::VeDirect => Registry {
                regs: db::VEDIRECT_REGS,
                defaults: db::VEDIRECT_DEFAULTS,
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Reg> {
        self.regs.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.regs.iter().map(|reg| reg.name).sorted().collect()
    }

    pub fn find(&self, name: &str) -> Result<&'static Reg, RegError> {
        self.regs
            .iter()
            .find(|reg| reg.name == name)
            .ok_or_else(|| RegError::NotFound(name.to_string()))
    }

    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Reg>, RegError> {
        names
            .iter()
            .map(|name| self.find(name.as_ref()).map(|reg| *reg))
            .collect()
    }

    /// Registers served when no explicit subset is configured.
    pub fn default_subset(&self) -> Vec<Reg> {
        self.regs
            .iter()
            .filter(|reg| self.defaults.contains(&reg.name))
            .cloned()
            .collect()
    }

    pub fn telegrams(&self) -> Vec<&'static Telegram> {
        self.regs
            .iter()
            .filter_map(|reg| match reg.address {
                Address::Telegram { telegram, .. } => Some(telegram),
                Address::Hex(_) => None,
            })
            .unique_by(|telegram| telegram.name)
            .collect()
    }
}
