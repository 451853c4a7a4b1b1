//! Logical commands and replies, independent of any wire format.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A typed command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    /// Rendered as `1`/`0` or `true`/`false` depending on framing.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Decimal number.
    Float(f64),
    /// Quoted on the wire where the framing quotes strings.
    Text(String),
}

impl Arg {
    /// The kind tag of this argument.
    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Int(_) => ArgKind::Int,
            Arg::Float(_) => ArgKind::Float,
            Arg::Bool(_) => ArgKind::Bool,
            Arg::Text(_) => ArgKind::Text,
        }
    }

    /// Numeric view of the argument, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Int(v) => Some(*v as f64),
            Arg::Float(v) => Some(*v),
            Arg::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Arg::Text(_) => None,
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<u16> for Arg {
    fn from(v: u16) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Text(v)
    }
}

/// Type of an argument, used when decoding wire frames back into commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    /// [`Arg::Int`].
    Int,
    /// [`Arg::Float`].
    Float,
    /// [`Arg::Bool`].
    Bool,
    /// [`Arg::Text`].
    Text,
}

/// A typed value carried by a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean reply.
    Bool(bool),
    /// Integer reply.
    Int(i64),
    /// Decimal reply.
    Float(f64),
    /// Text reply with the terminator stripped.
    Text(String),
    /// Payload of a binary block.
    Bytes(Vec<u8>),
    /// Multi-field replies and multi-output native calls.
    List(Vec<Value>),
}

impl Value {
    /// Numeric view of the value. Integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view of the value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    f64 => Float,
    &str => Text,
    String => Text,
    Vec<u8> => Bytes,
    Vec<Value> => List,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Expected shape of a reply, used by the codec to type the raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyShape {
    /// Fire-and-forget: no reply is read.
    #[default]
    None,
    /// A bare acknowledgement token (e.g. `OK`).
    Ack,
    /// Integer, float, or text, whichever parses first.
    Auto,
    /// Raw text.
    Text,
    /// Integer count in the given radix.
    Integer {
        /// Base of the digits, 2 to 36.
        #[serde(default = "default_radix")]
        radix: u32,
    },
    /// Decimal floating point.
    Float,
    /// Fixed point: an integer count multiplied by `scale`
    /// (e.g. hundredths of a degree with `scale = 0.01`).
    Fixed {
        /// Physical value of one count; finite and non-zero.
        scale: f64,
        /// Base of the digits, 2 to 36.
        #[serde(default = "default_radix")]
        radix: u32,
    },
    /// `1/0`, `ON/OFF`, `true/false`.
    Bool,
    /// Several fields split on `separator`, each typed by its own shape.
    Fields {
        /// Splits the reply line; must not be empty.
        separator: String,
        /// One shape per field, in order.
        fields: Vec<ReplyShape>,
    },
    /// IEEE-488.2 definite-length binary block.
    Block,
}

fn default_radix() -> u32 {
    10
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// The device acknowledged the command (or it was fire-and-forget).
    Ack,
    /// The device answered with a value.
    Value(Value),
    /// The device answered with an error token.
    Error {
        /// Device error number, or -1 when none was given.
        code: i32,
        /// Device error text.
        message: String,
    },
}

impl Reply {
    /// The carried value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Reply::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Consume the reply and return the carried value, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Reply::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// A logical command: name, ordered typed arguments and the reply it expects.
///
/// Built once with the consuming builder methods and not mutated afterwards.
///
/// ```
/// use rust_instrument::command::{Command, ReplyShape};
/// use std::time::Duration;
///
/// let set = Command::new("SET_POSITION").arg(10.0);
/// assert!(!set.expects_reply());
///
/// let get = Command::query("GET_POSITION", ReplyShape::Float)
///     .with_timeout(Duration::from_millis(250));
/// assert!(get.expects_reply());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
    reply: ReplyShape,
    timeout_override: Option<Duration>,
    retry_override: Option<u32>,
}

impl Command {
    /// A fire-and-forget command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            reply: ReplyShape::None,
            timeout_override: None,
            retry_override: None,
        }
    }

    /// A command that expects a reply of the given shape.
    pub fn query(name: impl Into<String>, shape: ReplyShape) -> Self {
        Self::new(name).with_reply(shape)
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the expected reply shape.
    pub fn with_reply(mut self, shape: ReplyShape) -> Self {
        self.reply = shape;
        self
    }

    /// Override the session's default reply timeout for this command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Override the dispatcher's retry count for this command.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_override = Some(retries);
        self
    }

    /// Wire name, e.g. `MOVE` or `MEAS:POW?`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments in wire order.
    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// Expected reply shape.
    pub fn reply_shape(&self) -> &ReplyShape {
        &self.reply
    }

    /// Whether the dispatcher waits for a reply after writing.
    pub fn expects_reply(&self) -> bool {
        self.reply != ReplyShape::None
    }

    /// Reply timeout set with `with_timeout`.
    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_override
    }

    /// Retry count set with `with_retries`.
    pub fn retry_override(&self) -> Option<u32> {
        self.retry_override
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            match arg {
                Arg::Int(v) => write!(f, " {v}")?,
                Arg::Float(v) => write!(f, " {v}")?,
                Arg::Bool(v) => write!(f, " {v}")?,
                Arg::Text(v) => write!(f, " {v:?}")?,
            }
        }
        Ok(())
    }
}
