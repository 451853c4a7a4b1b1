//! Four-byte register framing used by OIF-style tunable laser assemblies.
//!
//! ```text
//! byte0: [checksum:4][lstrsp:1][0:1][status or rw:2]
//! byte1: register
//! byte2: data high
//! byte3: data low
//! ```
//!
//! Requests carry the read/write flag in bit 0 of byte0; replies carry a
//! two-bit status there (`OK`, `XE`, `AEA`, `CP`).

use tracing::debug;

use crate::command::{Arg, Command, Reply, ReplyShape, Value};
use crate::error::CodecError;

use super::{fixed_to_float, float_to_fixed, Frame};

pub(super) const FRAME_LEN: usize = 4;

const READ: u8 = 0x00;
const WRITE: u8 = 0x01;

/// Reply status bits (byte0 & 0x03).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    /// Data holds the register value.
    Ok = 0,
    /// Data holds a device error code.
    ExecutionError = 1,
    /// The value continues in the extended address register.
    ExtendedAddress = 2,
    /// The device is still executing the previous write.
    CommandPending = 3,
}

impl RegisterStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => RegisterStatus::Ok,
            1 => RegisterStatus::ExecutionError,
            2 => RegisterStatus::ExtendedAddress,
            _ => RegisterStatus::CommandPending,
        }
    }
}

/// BIP-4 checksum over the frame, ignoring the checksum nibble itself.
pub fn register_checksum(frame: [u8; 4]) -> u8 {
    let bip8 = (frame[0] & 0x0f) ^ frame[1] ^ frame[2] ^ frame[3];
    ((bip8 & 0xf0) >> 4) ^ (bip8 & 0x0f)
}

fn seal(low_nibble: u8, register: u8, data: u16) -> [u8; 4] {
    let [hi, lo] = data.to_be_bytes();
    let mut frame = [low_nibble & 0x0f, register, hi, lo];
    frame[0] |= register_checksum(frame) << 4;
    frame
}

/// Build a reply frame as a device would send it.
pub fn register_reply_frame(register: u8, status: RegisterStatus, data: u16) -> [u8; 4] {
    seal(status as u8, register, data)
}

fn checked(bytes: &[u8]) -> Result<[u8; 4], CodecError> {
    let frame: [u8; 4] = bytes
        .get(..FRAME_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            CodecError::Malformed(format!("short register frame: {} of 4 bytes", bytes.len()))
        })?;
    if bytes.len() > FRAME_LEN {
        return Err(CodecError::Malformed(format!(
            "register frame has {} bytes",
            bytes.len()
        )));
    }
    if register_checksum(frame) != frame[0] >> 4 {
        return Err(CodecError::Malformed(format!(
            "register frame checksum mismatch: {frame:02X?}"
        )));
    }
    Ok(frame)
}

fn int_arg(arg: Option<&Arg>, what: &str, max: i64) -> Result<i64, CodecError> {
    match arg {
        None => Ok(0),
        Some(Arg::Int(v)) if (0..=max).contains(v) => Ok(*v),
        Some(other) => Err(CodecError::InvalidArgument(format!(
            "{what} must be an integer in 0..={max}, got {other:?}"
        ))),
    }
}

pub(super) fn encode(command: &Command) -> Result<Frame, CodecError> {
    let rw = match command.name().to_ascii_uppercase().as_str() {
        "READ" => READ,
        "WRITE" => WRITE,
        other => {
            return Err(CodecError::InvalidArgument(format!(
                "register framing only knows READ/WRITE, not '{other}'"
            )));
        }
    };
    let args = command.arguments();
    if args.is_empty() || args.len() > 2 {
        return Err(CodecError::InvalidArgument(
            "register commands take (register[, data])".into(),
        ));
    }
    let register = int_arg(args.first(), "register", 0xff)? as u8;
    let data = int_arg(args.get(1), "data", 0xffff)? as u16;
    Ok(Frame::Bytes(seal(rw, register, data).to_vec()))
}

pub(super) fn decode_command(bytes: &[u8]) -> Result<Command, CodecError> {
    let frame = checked(bytes)?;
    let name = if frame[0] & 0x01 == WRITE { "WRITE" } else { "READ" };
    let data = u16::from_be_bytes([frame[2], frame[3]]);
    Ok(Command::new(name).arg(frame[1] as i64).arg(data as i64))
}

pub(super) fn parse(bytes: &[u8], shape: &ReplyShape) -> Result<Reply, CodecError> {
    let frame = checked(bytes)?;
    let register = frame[1];
    let data = u16::from_be_bytes([frame[2], frame[3]]);

    match RegisterStatus::from_bits(frame[0]) {
        RegisterStatus::Ok => {}
        RegisterStatus::ExecutionError => {
            return Ok(Reply::Error {
                code: data as i32,
                message: format!("execution error on register 0x{register:02X}"),
            });
        }
        RegisterStatus::ExtendedAddress => {
            debug!(register, length = data, "Register reply uses extended addressing");
        }
        RegisterStatus::CommandPending => {
            debug!(register, "Register command still pending");
        }
    }

    let value = match shape {
        ReplyShape::None | ReplyShape::Ack => return Ok(Reply::Ack),
        ReplyShape::Auto | ReplyShape::Integer { .. } => Value::Int(data as i64),
        // Fixed-point register values are signed (e.g. temperature in 1/100 C).
        ReplyShape::Fixed { scale, .. } => Value::Float(fixed_to_float(data as i16 as i64, *scale)),
        ReplyShape::Bool => Value::Bool(data != 0),
        other => {
            return Err(CodecError::Unsupported(format!(
                "{other:?} does not fit a 16-bit register"
            )));
        }
    };
    Ok(Reply::Value(value))
}

pub(super) fn encode_reply(
    register: u8,
    reply: &Reply,
    shape: &ReplyShape,
) -> Result<Vec<u8>, CodecError> {
    let (status, data) = match reply {
        Reply::Ack => (RegisterStatus::Ok, 0u16),
        Reply::Error { code, .. } => (RegisterStatus::ExecutionError, *code as u16),
        Reply::Value(value) => {
            let data = match (shape, value) {
                (ReplyShape::Fixed { scale, .. }, v) => {
                    let number = v.as_f64().ok_or_else(|| {
                        CodecError::InvalidArgument(format!("{v} is not numeric"))
                    })?;
                    let count = float_to_fixed(number, *scale)?;
                    i16::try_from(count).map_err(|_| {
                        CodecError::InvalidArgument(format!("{number} overflows 16 bits"))
                    })? as u16
                }
                (_, Value::Bool(b)) => *b as u16,
                (_, Value::Int(v)) => u16::try_from(*v).map_err(|_| {
                    CodecError::InvalidArgument(format!("{v} does not fit 16 bits"))
                })?,
                (_, other) => {
                    return Err(CodecError::Unsupported(format!(
                        "cannot place {other} in a register"
                    )));
                }
            };
            (RegisterStatus::Ok, data)
        }
    };
    Ok(register_reply_frame(register, status, data).to_vec())
}
