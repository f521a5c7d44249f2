//! Packet serialization and deserialization
//!
//! Packet formats (RFC 1350, RFC 2347):
//!
//! ```text
//! RRQ/WRQ | 01/02 | Filename | 0 | Mode | 0 | Opt1 | 0 | Value1 | 0 | ...
//! DATA    | 03    | Block#   | Data
//! ACK     | 04    | Block#
//! ERROR   | 05    | ErrorCode | ErrMsg | 0
//! OACK    | 06    | Opt1 | 0 | Value1 | 0 | ...
//! ```

use std::fmt;
use std::str;

use thiserror::Error;

use super::options::{OptionType, TransferOption};

/// Transfer mode sent in requests. Only binary transfers are performed.
pub const OCTET_MODE: &str = "octet";

/// Why a byte sequence could not be turned into a [`Packet`] (or back)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPacket {
    #[error("packet too short: {0} bytes")]
    Truncated(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("missing NUL terminator after {0}")]
    Unterminated(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("option '{name}' has non-numeric value '{value}'")]
    InvalidOptionValue { name: String, value: String },
    #[error("{0} contains an embedded NUL byte")]
    EmbeddedNul(&'static str),
}

/// Packet opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Oack => "OACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Standard error codes (RFC 1350, RFC 2347) and their messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Message sent alongside the code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined, see error message (if any).",
            Self::FileNotFound => "File not found.",
            Self::AccessViolation => "Access violation.",
            Self::DiskFull => "Disk full or allocation exceeded.",
            Self::IllegalOperation => "Illegal TFTP operation.",
            Self::UnknownTransferId => "Unknown transfer ID.",
            Self::FileAlreadyExists => "File already exists.",
            Self::NoSuchUser => "No such user.",
            Self::OptionNegotiationFailed => "Option negotiation failed.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Vec<TransferOption>,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Vec<TransferOption>,
    },
    Data {
        block_num: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: ErrorCode,
        msg: String,
    },
    Oack(Vec<TransferOption>),
}

impl Packet {
    /// Build an ERROR packet carrying the standard message for `code`
    pub fn error(code: ErrorCode) -> Self {
        Packet::Error {
            code,
            msg: code.default_message().to_string(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack(_) => Opcode::Oack,
        }
    }

    /// Block number carried by DATA and ACK packets
    pub fn block_num(&self) -> Option<u16> {
        match self {
            Packet::Data { block_num, .. } => Some(*block_num),
            Packet::Ack(block_num) => Some(*block_num),
            _ => None,
        }
    }

    /// Encode the packet into its wire form
    pub fn serialize(&self) -> Result<Vec<u8>, InvalidPacket> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                write_cstr(&mut buf, filename, "filename")?;
                write_cstr(&mut buf, mode, "mode")?;
                write_options(&mut buf, options);
            }
            Packet::Data { block_num, data } => {
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block_num) => {
                buf.extend_from_slice(&block_num.to_be_bytes());
            }
            Packet::Error { code, msg } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                write_cstr(&mut buf, msg, "error message")?;
            }
            Packet::Oack(options) => write_options(&mut buf, options),
        }

        Ok(buf)
    }

    /// Decode a packet from untrusted bytes
    pub fn deserialize(buf: &[u8]) -> Result<Self, InvalidPacket> {
        if buf.len() < 2 {
            return Err(InvalidPacket::Truncated(buf.len()));
        }

        let raw_opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw_opcode).ok_or(InvalidPacket::UnknownOpcode(raw_opcode))?;
        let body = &buf[2..];

        let packet = match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let (filename, rest) = read_cstr(body, "filename")?;
                let (mode, rest) = read_cstr(rest, "mode")?;
                let options = read_options(rest)?;
                if opcode == Opcode::Rrq {
                    Packet::Rrq {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    Packet::Wrq {
                        filename,
                        mode,
                        options,
                    }
                }
            }
            Opcode::Data => {
                let block_num = read_u16(body, buf.len())?;
                Packet::Data {
                    block_num,
                    data: body[2..].to_vec(),
                }
            }
            Opcode::Ack => Packet::Ack(read_u16(body, buf.len())?),
            Opcode::Error => {
                let raw_code = read_u16(body, buf.len())?;
                let (msg, _) = read_cstr(&body[2..], "error message")?;
                // Codes outside the standard table are reported as generic errors.
                let code = ErrorCode::from_u16(raw_code).unwrap_or(ErrorCode::NotDefined);
                Packet::Error { code, msg }
            }
            Opcode::Oack => Packet::Oack(read_options(body)?),
        };

        Ok(packet)
    }
}

fn read_u16(body: &[u8], total: usize) -> Result<u16, InvalidPacket> {
    match body {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(InvalidPacket::Truncated(total)),
    }
}

fn write_cstr(buf: &mut Vec<u8>, s: &str, what: &'static str) -> Result<(), InvalidPacket> {
    if s.as_bytes().contains(&0) {
        return Err(InvalidPacket::EmbeddedNul(what));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn write_options(buf: &mut Vec<u8>, options: &[TransferOption]) {
    for opt in options {
        buf.extend_from_slice(opt.option.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(opt.value.to_string().as_bytes());
        buf.push(0);
    }
}

/// Split off a NUL-terminated string, returning it and the remaining bytes
fn read_cstr<'a>(buf: &'a [u8], what: &'static str) -> Result<(String, &'a [u8]), InvalidPacket> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(InvalidPacket::Unterminated(what))?;
    let s = str::from_utf8(&buf[..end]).map_err(|_| InvalidPacket::InvalidUtf8(what))?;
    Ok((s.to_string(), &buf[end + 1..]))
}

fn read_options(mut buf: &[u8]) -> Result<Vec<TransferOption>, InvalidPacket> {
    let mut options = Vec::new();
    while !buf.is_empty() {
        let (name, rest) = read_cstr(buf, "option name")?;
        let (value, rest) = read_cstr(rest, "option value")?;
        buf = rest;

        // Unknown options are skipped (RFC 2347)
        let Some(option) = OptionType::from_name(&name) else {
            log::debug!("Ignoring unsupported option {}={}", name, value);
            continue;
        };
        let value = value
            .parse::<u64>()
            .map_err(|_| InvalidPacket::InvalidOptionValue { name, value })?;
        options.push(TransferOption { option, value });
    }
    Ok(options)
}
