//! Frame codec: logical [`Command`]/[`Reply`] <-> transport wire data.
//!
//! The codec is pure. A [`FrameCodec`] only carries immutable framing
//! settings; every call is a function of its inputs.
//!
//! | Framing    | Transport         | Wire shape                                  |
//! |------------|-------------------|---------------------------------------------|
//! | `Line`     | serial            | `NAME a1 a2\n`                               |
//! | `Scpi`     | VISA / serial     | `NAME a1,"text",ON\n`                        |
//! | `Register` | serial (binary)   | 4 bytes: checksum/rw, register, data (BE)    |
//! | `Call`     | native library    | `NativeCall { function, args }`              |

mod call;
mod register;
mod text;

pub use register::{register_checksum, register_reply_frame, RegisterStatus};
pub(crate) use text::block_len;

use serde::{Deserialize, Serialize};

use crate::command::{Arg, ArgKind, Command, Reply, ReplyShape};
use crate::error::CodecError;
use crate::transport::TransportKind;

/// A foreign function invocation: the native-library analogue of a byte frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCall {
    /// Full library symbol, prefix included.
    pub function: String,
    /// Input arguments in call order.
    pub args: Vec<Arg>,
}

/// An encoded command, ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Bytes for a serial or VISA stream.
    Bytes(Vec<u8>),
    /// A call for a native library.
    Call(NativeCall),
}

impl Frame {
    /// Byte payload, if this is a byte frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Bytes(b) => Some(b),
            Frame::Call(_) => None,
        }
    }
}

/// Raw data handed back by a transport read.
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    /// One complete reply read from a byte stream.
    Bytes(Vec<u8>),
    /// Output values of a native call.
    Native(Vec<crate::command::Value>),
}

/// How a transport should delimit the next reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadUntil {
    /// Read up to and including this byte.
    Terminator(u8),
    /// Read exactly this many bytes.
    Length(usize),
    /// Read an IEEE-488.2 definite-length block (`#<n><len><data>`), falling
    /// back to the terminator for `#0` indefinite blocks and for headers that
    /// give no usable length.
    Block {
        /// Ends replies that are not definite-length blocks.
        terminator: u8,
    },
    /// Collect the outputs of the last native call.
    Call,
}

/// Wire syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Terminated ASCII lines, `NAME arg arg`.
    Line,
    /// SCPI text: comma-separated arguments, IEEE-488.2 blocks.
    Scpi,
    /// Fixed four-byte frames with a checksum nibble.
    Register,
    /// Function calls into a vendor library.
    Call,
}

/// Framing settings. Usually supplied by a device profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Wire syntax these settings apply to.
    pub framing: Framing,
    /// Appended to every text command (e.g. `"\n"`, `"\r"`, `"\r\n"`).
    pub command_terminator: String,
    /// Last byte of a text reply line.
    pub reply_terminator: char,
    /// Prefixes that mark a device error reply (`ERROR 12 ...`, `error:9`).
    pub error_prefixes: Vec<String>,
    /// Tokens accepted as a bare acknowledgement. Empty accepts any line.
    pub ack_tokens: Vec<String>,
    /// Keep only the text after the last occurrence of this character
    /// (instruments that echo the query, e.g. `WAVELENGTH:800`).
    pub echo_separator: Option<char>,
    /// Prefix prepended to command names for native calls (e.g. `TLPM_`).
    pub function_prefix: String,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self::line()
    }
}

impl FramingConfig {
    /// Newline-terminated ASCII lines.
    pub fn line() -> Self {
        Self {
            framing: Framing::Line,
            command_terminator: "\n".to_string(),
            reply_terminator: '\n',
            error_prefixes: vec!["ERROR".into(), "error:".into(), "ERR".into()],
            ack_tokens: vec!["OK".into()],
            echo_separator: None,
            function_prefix: String::new(),
        }
    }

    /// SCPI over VISA or serial.
    pub fn scpi() -> Self {
        Self {
            framing: Framing::Scpi,
            ..Self::line()
        }
    }

    /// Four-byte register frames.
    pub fn register() -> Self {
        Self {
            framing: Framing::Register,
            command_terminator: String::new(),
            error_prefixes: Vec::new(),
            ack_tokens: Vec::new(),
            ..Self::line()
        }
    }

    /// Native library calls with an optional function-name prefix.
    pub fn call(function_prefix: impl Into<String>) -> Self {
        Self {
            framing: Framing::Call,
            command_terminator: String::new(),
            error_prefixes: Vec::new(),
            ack_tokens: Vec::new(),
            function_prefix: function_prefix.into(),
            ..Self::line()
        }
    }

    /// The default framing for a transport kind.
    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Serial => Self::line(),
            TransportKind::Visa => Self::scpi(),
            TransportKind::Native => Self::call(""),
        }
    }

    /// Replace the command terminator.
    pub fn with_command_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.command_terminator = terminator.into();
        self
    }

    /// Replace the reply terminator.
    pub fn with_reply_terminator(mut self, terminator: char) -> Self {
        self.reply_terminator = terminator;
        self
    }

    /// Strip echoed queries up to `separator`.
    pub fn with_echo_separator(mut self, separator: char) -> Self {
        self.echo_separator = Some(separator);
        self
    }

    /// Replace the device error prefixes.
    pub fn with_error_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the acknowledgement tokens.
    pub fn with_ack_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ack_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }
}

/// Stateless encoder/decoder for one framing.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCodec {
    config: FramingConfig,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FramingConfig::default())
    }
}

impl FrameCodec {
    /// Build a codec for `config`.
    pub fn new(mut config: FramingConfig) -> Self {
        // Longest prefix first so "ERROR" wins over "ERR".
        config
            .error_prefixes
            .sort_by_key(|p| std::cmp::Reverse(p.len()));
        Self { config }
    }

    /// Codec with the default framing for a transport kind.
    pub fn for_kind(kind: TransportKind) -> Self {
        Self::new(FramingConfig::for_kind(kind))
    }

    /// Settings this codec was built with.
    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Wire syntax of this codec.
    pub fn framing(&self) -> Framing {
        self.config.framing
    }

    /// Render a command as a transport frame.
    pub fn encode(&self, command: &Command) -> Result<Frame, CodecError> {
        match self.config.framing {
            Framing::Line | Framing::Scpi => text::encode(&self.config, command),
            Framing::Register => register::encode(command),
            Framing::Call => Ok(call::encode(&self.config, command)),
        }
    }

    /// How the transport should delimit the reply to `command`.
    pub fn read_until_for(&self, command: &Command) -> ReadUntil {
        let terminator = self.config.reply_terminator as u8;
        match self.config.framing {
            Framing::Line | Framing::Scpi => match command.reply_shape() {
                ReplyShape::Block => ReadUntil::Block { terminator },
                _ => ReadUntil::Terminator(terminator),
            },
            Framing::Register => ReadUntil::Length(register::FRAME_LEN),
            Framing::Call => ReadUntil::Call,
        }
    }

    /// Parse a raw reply into a [`Reply`], keeping device errors as
    /// [`Reply::Error`].
    pub fn parse(&self, raw: &RawReply, shape: &ReplyShape) -> Result<Reply, CodecError> {
        match (self.config.framing, raw) {
            (Framing::Line | Framing::Scpi, RawReply::Bytes(bytes)) => {
                text::parse(&self.config, bytes, shape)
            }
            (Framing::Register, RawReply::Bytes(bytes)) => register::parse(bytes, shape),
            (Framing::Call, RawReply::Native(outputs)) => call::parse(outputs, shape),
            (framing, other) => Err(CodecError::Malformed(format!(
                "{framing:?} framing cannot decode {}",
                match other {
                    RawReply::Bytes(_) => "a byte reply",
                    RawReply::Native(_) => "native call outputs",
                }
            ))),
        }
    }

    /// Decode a raw reply. A recognised device-error token becomes
    /// [`CodecError::DeviceError`].
    pub fn decode(&self, raw: &RawReply, shape: &ReplyShape) -> Result<Reply, CodecError> {
        match self.parse(raw, shape)? {
            Reply::Error { code, message } => Err(CodecError::DeviceError { code, message }),
            reply => Ok(reply),
        }
    }

    /// Parse a frame back into the command it encodes.
    ///
    /// `kinds` types the arguments; when empty, argument types are inferred
    /// from their wire spelling. The returned command carries the frame's
    /// name and arguments only.
    pub fn decode_command(&self, frame: &Frame, kinds: &[ArgKind]) -> Result<Command, CodecError> {
        match (self.config.framing, frame) {
            (Framing::Line | Framing::Scpi, Frame::Bytes(bytes)) => {
                text::decode_command(&self.config, bytes, kinds)
            }
            (Framing::Register, Frame::Bytes(bytes)) => register::decode_command(bytes),
            (Framing::Call, Frame::Call(call)) => call::decode_command(&self.config, call),
            (framing, _) => Err(CodecError::Malformed(format!(
                "frame does not match {framing:?} framing"
            ))),
        }
    }

    /// Render a reply the way a device would send it.
    pub fn encode_reply(&self, reply: &Reply, shape: &ReplyShape) -> Result<RawReply, CodecError> {
        match self.config.framing {
            Framing::Line | Framing::Scpi => {
                text::encode_reply(&self.config, reply, shape).map(RawReply::Bytes)
            }
            Framing::Register => register::encode_reply(0, reply, shape).map(RawReply::Bytes),
            Framing::Call => call::encode_reply(reply, shape).map(RawReply::Native),
        }
    }
}

/// Shortest round-trip decimal with a guaranteed fractional part.
pub(crate) fn format_float(value: f64) -> Result<String, CodecError> {
    if !value.is_finite() {
        return Err(CodecError::InvalidArgument(format!(
            "non-finite float {value}"
        )));
    }
    let mut s = value.to_string();
    if !s.contains('.') {
        s.push_str(".0");
    }
    Ok(s)
}

pub(crate) fn format_int(value: i64, radix: u32) -> Result<String, CodecError> {
    let magnitude = value.unsigned_abs();
    let digits = match radix {
        2 => format!("{magnitude:b}"),
        8 => format!("{magnitude:o}"),
        10 => magnitude.to_string(),
        16 => format!("{magnitude:X}"),
        other => {
            return Err(CodecError::Unsupported(format!("radix {other}")));
        }
    };
    Ok(if value < 0 { format!("-{digits}") } else { digits })
}

/// Radices accepted when parsing integer replies.
pub const RADIX_RANGE: std::ops::RangeInclusive<u32> = 2..=36;

pub(crate) fn parse_int(token: &str, radix: u32) -> Result<i64, CodecError> {
    if !RADIX_RANGE.contains(&radix) {
        return Err(CodecError::Unsupported(format!("radix {radix}")));
    }
    let malformed = || CodecError::Malformed(format!("'{token}' is not a base-{radix} integer"));
    let trimmed = token.trim();
    let (sign, body) = match trimmed.as_bytes().first() {
        Some(b'-') => ("-", &trimmed[1..]),
        Some(b'+') => ("", &trimmed[1..]),
        _ => ("", trimmed),
    };
    let body = if radix == 16 {
        body.strip_prefix("0x")
            .or_else(|| body.strip_prefix("0X"))
            .unwrap_or(body)
    } else {
        body
    };
    if body.is_empty() || body.starts_with(['+', '-']) {
        return Err(malformed());
    }
    i64::from_str_radix(&format!("{sign}{body}"), radix).map_err(|_| malformed())
}

pub(crate) fn parse_float(token: &str) -> Result<f64, CodecError> {
    token
        .trim()
        .parse::<f64>()
        .map_err(|_| CodecError::Malformed(format!("'{token}' is not a number")))
}

pub(crate) fn parse_bool(token: &str) -> Result<bool, CodecError> {
    match token.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" | "TRUE" => Ok(true),
        "0" | "OFF" | "FALSE" => Ok(false),
        _ => Err(CodecError::Malformed(format!("'{token}' is not a boolean"))),
    }
}

/// Integer count -> fixed-point value, exact for decimal scales like 0.01.
pub(crate) fn fixed_to_float(count: i64, scale: f64) -> f64 {
    let inverse = 1.0 / scale;
    if (inverse - inverse.round()).abs() < 1e-9 && inverse.abs() >= 1.0 {
        count as f64 / inverse.round()
    } else {
        count as f64 * scale
    }
}

pub(crate) fn float_to_fixed(value: f64, scale: f64) -> Result<i64, CodecError> {
    if !value.is_finite() || scale == 0.0 {
        return Err(CodecError::InvalidArgument(format!(
            "cannot express {value} with scale {scale}"
        )));
    }
    Ok((value / scale).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_float_always_has_fraction() {
        assert_eq!(format_float(10.0).unwrap(), "10.0");
        assert_eq!(format_float(-0.25).unwrap(), "-0.25");
        assert_eq!(format_float(1e-7).unwrap(), "0.0000001");
        assert!(format_float(f64::NAN).is_err());
    }

    #[test]
    fn test_int_radix_helpers() {
        assert_eq!(format_int(255, 16).unwrap(), "FF");
        assert_eq!(format_int(-5, 2).unwrap(), "-101");
        assert_eq!(parse_int("0xff", 16).unwrap(), 255);
        assert_eq!(parse_int("-101", 2).unwrap(), -5);
        assert_eq!(parse_int("12", 7).unwrap(), 9);
        assert!(parse_int("19", 7).is_err());
        assert!(format_int(1, 7).is_err());
    }

    #[test]
    fn test_parse_int_rejects_bad_radix_and_signs() {
        assert!(matches!(parse_int("5", 1), Err(CodecError::Unsupported(_))));
        assert!(matches!(parse_int("5", 37), Err(CodecError::Unsupported(_))));
        assert!(parse_int("--5", 10).is_err());
        assert!(parse_int("+-5", 10).is_err());
        assert!(parse_int("-0x-5", 16).is_err());
        assert!(parse_int("--9223372036854775808", 10).is_err());
        assert!(parse_int("-", 10).is_err());
        assert_eq!(parse_int("-0x1F", 16).unwrap(), -31);
        assert_eq!(parse_int("+42", 10).unwrap(), 42);
    }

    #[test]
    fn test_int_extremes_round_trip() {
        for radix in [2, 8, 10, 16] {
            for value in [i64::MIN, i64::MAX, 0, -1] {
                let text = format_int(value, radix).unwrap();
                assert_eq!(parse_int(&text, radix).unwrap(), value, "{text} base {radix}");
            }
        }
    }

    #[test]
    fn test_fixed_point_is_exact_for_decimal_scales() {
        assert_eq!(fixed_to_float(2550, 0.01), 25.5);
        assert_eq!(fixed_to_float(-1234, 0.001), -1.234);
        assert_eq!(float_to_fixed(25.5, 0.01).unwrap(), 2550);
        assert_eq!(fixed_to_float(3, 2.0), 6.0);
    }

    #[test]
    fn test_mismatched_raw_reply_is_malformed() {
        let codec = FrameCodec::for_kind(TransportKind::Native);
        let err = codec
            .decode(&RawReply::Bytes(b"1\n".to_vec()), &ReplyShape::Auto)
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_read_until_follows_framing() {
        let line = FrameCodec::for_kind(TransportKind::Serial);
        assert_eq!(
            line.read_until_for(&Command::query("X?", ReplyShape::Float)),
            ReadUntil::Terminator(b'\n')
        );
        assert_eq!(
            line.read_until_for(&Command::query("CURV?", ReplyShape::Block)),
            ReadUntil::Block { terminator: b'\n' }
        );
        let reg = FrameCodec::new(FramingConfig::register());
        assert_eq!(
            reg.read_until_for(&Command::query("READ", ReplyShape::Integer { radix: 10 })),
            ReadUntil::Length(4)
        );
    }
}
