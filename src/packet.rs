use std::fmt;
use std::str;

use thiserror::Error;

use crate::BLOCK_SIZE;

pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;

/// Error code carried by an `ERROR` packet.
///
/// Codes form an open set: values without a named constant survive a
/// decode/encode cycle unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const NOT_DEFINED: ErrorCode = ErrorCode(0);
    pub const FILE_NOT_FOUND: ErrorCode = ErrorCode(1);
    pub const ACCESS_VIOLATION: ErrorCode = ErrorCode(2);
    pub const DISK_FULL: ErrorCode = ErrorCode(3);
    pub const ILLEGAL_OPERATION: ErrorCode = ErrorCode(4);
    pub const UNKNOWN_TID: ErrorCode = ErrorCode(5);
    pub const FILE_EXISTS: ErrorCode = ErrorCode(6);
    pub const NO_SUCH_USER: ErrorCode = ErrorCode(7);

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            ErrorCode::NOT_DEFINED => "not defined",
            ErrorCode::FILE_NOT_FOUND => "file not found",
            ErrorCode::ACCESS_VIOLATION => "access violation",
            ErrorCode::DISK_FULL => "disk full",
            ErrorCode::ILLEGAL_OPERATION => "illegal operation",
            ErrorCode::UNKNOWN_TID => "unknown transfer id",
            ErrorCode::FILE_EXISTS => "file already exists",
            ErrorCode::NO_SUCH_USER => "no such user",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "error code {}", self.0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short: {len} bytes")]
    Truncated { opcode: Option<u16>, len: usize },

    #[error("invalid opcode: {0}")]
    UnknownOpcode(u16),

    #[error("missing cstr terminator")]
    MissingTerminator,

    #[error("invalid cstr encoding")]
    InvalidEncoding,

    #[error("data payload of {0} bytes exceeds block size")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    RRQ { filename: String, mode: String },
    WRQ { filename: String, mode: String },
    DATA { block: u16, data: Vec<u8> },
    ACK(u16),
    ERROR { code: ErrorCode, msg: String },
}

impl TftpPacket {
    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        TftpPacket::ERROR {
            code,
            msg: msg.into(),
        }
    }

    pub fn opcode(&self) -> u16 {
        match self {
            TftpPacket::RRQ { .. } => OPCODE_RRQ,
            TftpPacket::WRQ { .. } => OPCODE_WRQ,
            TftpPacket::DATA { .. } => OPCODE_DATA,
            TftpPacket::ACK(_) => OPCODE_ACK,
            TftpPacket::ERROR { .. } => OPCODE_ERROR,
        }
    }

    /// Encodes the packet into its wire form.
    ///
    /// Strings must not contain NUL bytes and a `DATA` payload must not
    /// exceed [`BLOCK_SIZE`]; both are the caller's responsibility.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::with_capacity(4 + BLOCK_SIZE);
        bytes.extend_from_slice(&self.opcode().to_be_bytes());

        match self {
            TftpPacket::RRQ { filename, mode } | TftpPacket::WRQ { filename, mode } => {
                push_cstr(&mut bytes, filename);
                push_cstr(&mut bytes, mode);
            }
            TftpPacket::DATA { block, data } => {
                debug_assert!(data.len() <= BLOCK_SIZE);
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            TftpPacket::ACK(block) => {
                bytes.extend_from_slice(&block.to_be_bytes());
            }
            TftpPacket::ERROR { code, msg } => {
                bytes.extend_from_slice(&code.0.to_be_bytes());
                push_cstr(&mut bytes, msg);
            }
        }
        bytes
    }

    /// Decodes one datagram.
    ///
    /// Anything after the mode field of a request (such as RFC 2347
    /// options) is ignored. An `ERROR` message without its terminator is
    /// accepted up to the end of the buffer.
    pub fn deserialize(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated {
                opcode: None,
                len: buf.len(),
            });
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        if !(OPCODE_RRQ..=OPCODE_ERROR).contains(&opcode) {
            return Err(DecodeError::UnknownOpcode(opcode));
        }
        // Requests need two terminators, everything else a 16-bit field.
        if buf.len() < 4 {
            return Err(DecodeError::Truncated {
                opcode: Some(opcode),
                len: buf.len(),
            });
        }

        let body = &buf[2..];
        let pkt = match opcode {
            OPCODE_RRQ | OPCODE_WRQ => {
                let (filename, rest) = read_cstr(body)?;
                let (mode, _options) = read_cstr(rest)?;
                if opcode == OPCODE_RRQ {
                    TftpPacket::RRQ { filename, mode }
                } else {
                    TftpPacket::WRQ { filename, mode }
                }
            }
            OPCODE_DATA => {
                let data = &body[2..];
                if data.len() > BLOCK_SIZE {
                    return Err(DecodeError::PayloadTooLarge(data.len()));
                }
                TftpPacket::DATA {
                    block: u16::from_be_bytes([body[0], body[1]]),
                    data: data.to_vec(),
                }
            }
            OPCODE_ACK => TftpPacket::ACK(u16::from_be_bytes([body[0], body[1]])),
            _ => {
                let code = ErrorCode(u16::from_be_bytes([body[0], body[1]]));
                let text = &body[2..];
                let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
                TftpPacket::ERROR {
                    code,
                    msg: String::from_utf8_lossy(&text[..end]).into_owned(),
                }
            }
        };

        Ok(pkt)
    }
}

fn push_cstr(bytes: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0));
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
}

// Reads a NUL-terminated string and returns it with the remaining bytes.
fn read_cstr(buf: &[u8]) -> Result<(String, &[u8]), DecodeError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator)?;
    let s = str::from_utf8(&buf[..pos])
        .map_err(|_| DecodeError::InvalidEncoding)?
        .to_string();
    Ok((s, &buf[pos + 1..]))
}
