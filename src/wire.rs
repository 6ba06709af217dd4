//! TFTP wire format
//!
//! Pure encoding and decoding of the six packet kinds (RFC 1350 plus
//! the RFC 2347 option extension). Nothing here touches a socket.

use crate::error::{Result, TftpError};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Protocol constants
pub mod constants {
    /// Read request
    pub const OP_RRQ: u16 = 1;
    /// Write request
    pub const OP_WRQ: u16 = 2;
    /// Data block
    pub const OP_DATA: u16 = 3;
    /// Acknowledgement
    pub const OP_ACK: u16 = 4;
    /// Error
    pub const OP_ERROR: u16 = 5;
    /// Option acknowledgement
    pub const OP_OACK: u16 = 6;

    /// Opcode plus block number
    pub const HEADER_LEN: usize = 4;
    /// Payload bytes per DATA packet unless negotiated otherwise
    pub const DEFAULT_BLOCK_SIZE: usize = 512;
    /// Smallest negotiable `blksize` value
    pub const MIN_BLOCK_SIZE: usize = 512;
    /// Largest negotiable `blksize` value
    pub const MAX_BLOCK_SIZE: usize = 65464;
    /// Receive buffer length for an un-negotiated session
    pub const DEFAULT_DATAGRAM_LEN: usize = HEADER_LEN + DEFAULT_BLOCK_SIZE;
}

use constants::*;

/// Error codes carried by ERROR packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
    OptionNegotiation,
}

impl ErrorCode {
    /// Decode a wire error code. Unknown values collapse to `NotDefined`.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::NotDefined,
        }
    }

    /// The wire representation of this code
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionNegotiation => 8,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::NotDefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "illegal TFTP operation",
            ErrorCode::UnknownTransferId => "unknown transfer ID",
            ErrorCode::FileExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::OptionNegotiation => "option negotiation failed",
        };
        write!(f, "{}", text)
    }
}

/// Negotiation options attached to a request or an OACK.
///
/// Names are lowercase after parsing. Insertion order is preserved:
/// the OACK must echo accepted options in the order the client sent
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, String)>);

impl Options {
    pub fn new() -> Self {
        Options(Vec::new())
    }

    /// Add or replace an option. The name is normalized to lowercase.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_lowercase();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// One TFTP packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Read request: the client wants to download `filename`
    Rrq {
        filename: String,
        mode: String,
        opts: Options,
    },
    /// Write request: the client wants to upload `filename`
    Wrq {
        filename: String,
        mode: String,
        opts: Options,
    },
    /// One block of payload
    Data { block: u16, payload: Bytes },
    /// Acknowledgement of one block
    Ack { block: u16 },
    /// The server's list of accepted options
    Oack(Options),
    /// Terminal error; never retransmitted, never acknowledged
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn opcode(&self) -> u16 {
        match self {
            Packet::Rrq { .. } => OP_RRQ,
            Packet::Wrq { .. } => OP_WRQ,
            Packet::Data { .. } => OP_DATA,
            Packet::Ack { .. } => OP_ACK,
            Packet::Oack(_) => OP_OACK,
            Packet::Error { .. } => OP_ERROR,
        }
    }

    /// Packet kind as a string for log output
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Rrq { .. } => "RRQ",
            Packet::Wrq { .. } => "WRQ",
            Packet::Data { .. } => "DATA",
            Packet::Ack { .. } => "ACK",
            Packet::Oack(_) => "OACK",
            Packet::Error { .. } => "ERROR",
        }
    }

    /// Encode this packet into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.opcode());
        match self {
            Packet::Rrq {
                filename,
                mode,
                opts,
            }
            | Packet::Wrq {
                filename,
                mode,
                opts,
            } => {
                put_cstr(buf, filename);
                put_cstr(buf, mode);
                put_options(buf, opts);
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(*block);
            }
            Packet::Oack(opts) => {
                put_options(buf, opts);
            }
            Packet::Error { code, message } => {
                buf.put_u16(code.as_u16());
                put_cstr(buf, message);
            }
        }
    }

    /// Decode one datagram
    pub fn decode(datagram: &[u8]) -> Result<Packet> {
        if datagram.len() < HEADER_LEN {
            return Err(TftpError::malformed(format!(
                "datagram of {} bytes is shorter than a TFTP header",
                datagram.len()
            )));
        }
        let opcode = u16::from_be_bytes([datagram[0], datagram[1]]);
        let body = &datagram[2..];
        match opcode {
            OP_RRQ => {
                let (filename, mode, opts) = take_request(body)?;
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    opts,
                })
            }
            OP_WRQ => {
                let (filename, mode, opts) = take_request(body)?;
                Ok(Packet::Wrq {
                    filename,
                    mode,
                    opts,
                })
            }
            OP_DATA => Ok(Packet::Data {
                block: u16::from_be_bytes([body[0], body[1]]),
                payload: Bytes::copy_from_slice(&body[2..]),
            }),
            OP_ACK => Ok(Packet::Ack {
                block: u16::from_be_bytes([body[0], body[1]]),
            }),
            OP_ERROR => {
                let code = ErrorCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
                let (message, _) = take_cstr(&body[2..])?;
                Ok(Packet::Error { code, message })
            }
            OP_OACK => Ok(Packet::Oack(take_options(body)?)),
            other => Err(TftpError::malformed(format!("unknown opcode {}", other))),
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut BytesMut, opts: &Options) {
    for (name, value) in opts.iter() {
        put_cstr(buf, name);
        put_cstr(buf, value);
    }
}

/// Split one NUL-terminated string off the front of `buf`
fn take_cstr(buf: &[u8]) -> Result<(String, &[u8])> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::malformed("string is missing its NUL terminator"))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| TftpError::malformed("string is not valid UTF-8"))?;
    Ok((s.to_string(), &buf[end + 1..]))
}

fn take_request(body: &[u8]) -> Result<(String, String, Options)> {
    let (filename, rest) = take_cstr(body)?;
    if rest.is_empty() {
        return Err(TftpError::malformed("request has no mode field"));
    }
    let (mode, rest) = take_cstr(rest)?;
    let opts = take_options(rest)?;
    Ok((filename, mode, opts))
}

fn take_options(mut rest: &[u8]) -> Result<Options> {
    let mut opts = Options::new();
    while !rest.is_empty() {
        let (name, after_name) = take_cstr(rest)?;
        if after_name.is_empty() {
            return Err(TftpError::malformed(format!(
                "option {:?} has no value",
                name
            )));
        }
        let (value, after_value) = take_cstr(after_name)?;
        opts.insert(name, value);
        rest = after_value;
    }
    Ok(opts)
}
