//! ASCII line and SCPI framings.

use crate::command::{Arg, ArgKind, Command, Reply, ReplyShape, Value};
use crate::error::CodecError;

use super::{
    fixed_to_float, float_to_fixed, format_float, format_int, parse_bool, parse_float, parse_int,
    Frame, Framing, FramingConfig,
};

pub(super) fn encode(config: &FramingConfig, command: &Command) -> Result<Frame, CodecError> {
    let name = command.name();
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(CodecError::InvalidArgument(format!(
            "command name '{name}' must be non-empty without whitespace"
        )));
    }

    let scpi = config.framing == Framing::Scpi;
    let rendered = command
        .arguments()
        .iter()
        .map(|arg| render_arg(arg, scpi))
        .collect::<Result<Vec<_>, _>>()?;

    let mut line = name.to_string();
    if !rendered.is_empty() {
        line.push(' ');
        line.push_str(&rendered.join(if scpi { "," } else { " " }));
    }
    line.push_str(&config.command_terminator);
    Ok(Frame::Bytes(line.into_bytes()))
}

fn render_arg(arg: &Arg, scpi: bool) -> Result<String, CodecError> {
    Ok(match arg {
        Arg::Int(v) => v.to_string(),
        Arg::Float(v) => format_float(*v)?,
        Arg::Bool(b) => match (scpi, b) {
            (true, true) => "ON".into(),
            (true, false) => "OFF".into(),
            (false, true) => "1".into(),
            (false, false) => "0".into(),
        },
        Arg::Text(s) => {
            let needs_quotes = scpi
                || s.is_empty()
                || s.chars().any(|c| c.is_whitespace() || c == '"' || c == ',');
            if s.contains(['\r', '\n']) {
                return Err(CodecError::InvalidArgument(
                    "text argument contains a line break".into(),
                ));
            }
            if needs_quotes {
                format!("\"{}\"", s.replace('"', "\"\""))
            } else {
                s.clone()
            }
        }
    })
}

/// A token split from an argument list, remembering whether it was quoted.
struct Token {
    text: String,
    quoted: bool,
}

fn tokenize(input: &str, separator: Option<char>) -> Result<Vec<Token>, CodecError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let token = if first == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        text.push('"');
                    }
                    Some('"') => break,
                    Some(c) => text.push(c),
                    None => {
                        return Err(CodecError::Malformed("unterminated quoted string".into()));
                    }
                }
            }
            Token { text, quoted: true }
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                let ends = match separator {
                    Some(sep) => c == sep,
                    None => c.is_whitespace(),
                };
                if ends {
                    break;
                }
                text.push(c);
                chars.next();
            }
            Token {
                text: text.trim_end().to_string(),
                quoted: false,
            }
        };
        tokens.push(token);

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if let Some(sep) = separator {
            match chars.peek() {
                Some(&c) if c == sep => {
                    chars.next();
                }
                Some(c) => {
                    return Err(CodecError::Malformed(format!(
                        "expected '{sep}' between arguments, found '{c}'"
                    )));
                }
                None => break,
            }
        }
    }
    Ok(tokens)
}

fn typed_arg(token: &Token, kind: ArgKind) -> Result<Arg, CodecError> {
    match kind {
        ArgKind::Text => Ok(Arg::Text(token.text.clone())),
        _ if token.quoted => Err(CodecError::Malformed(format!(
            "quoted '{}' where a {kind:?} was expected",
            token.text
        ))),
        ArgKind::Int => Ok(Arg::Int(parse_int(&token.text, 10)?)),
        ArgKind::Float => Ok(Arg::Float(parse_float(&token.text)?)),
        ArgKind::Bool => Ok(Arg::Bool(parse_bool(&token.text)?)),
    }
}

fn inferred_arg(token: &Token, scpi: bool) -> Arg {
    if token.quoted {
        return Arg::Text(token.text.clone());
    }
    if let Ok(v) = token.text.parse::<i64>() {
        return Arg::Int(v);
    }
    if let Ok(v) = token.text.parse::<f64>() {
        return Arg::Float(v);
    }
    if scpi {
        match token.text.to_ascii_uppercase().as_str() {
            "ON" => return Arg::Bool(true),
            "OFF" => return Arg::Bool(false),
            _ => {}
        }
    }
    Arg::Text(token.text.clone())
}

pub(super) fn decode_command(
    config: &FramingConfig,
    bytes: &[u8],
    kinds: &[ArgKind],
) -> Result<Command, CodecError> {
    let line = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::Malformed("command is not valid UTF-8".into()))?;
    let line = line
        .strip_suffix(config.command_terminator.as_str())
        .unwrap_or(line)
        .trim();

    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest),
        None => (line, ""),
    };
    if name.is_empty() {
        return Err(CodecError::Malformed("empty command".into()));
    }

    let scpi = config.framing == Framing::Scpi;
    let tokens = tokenize(rest, scpi.then_some(','))?;

    let args = if kinds.is_empty() {
        tokens.iter().map(|t| inferred_arg(t, scpi)).collect()
    } else {
        if tokens.len() != kinds.len() {
            return Err(CodecError::Malformed(format!(
                "'{name}' has {} arguments, expected {}",
                tokens.len(),
                kinds.len()
            )));
        }
        tokens
            .iter()
            .zip(kinds)
            .map(|(t, k)| typed_arg(t, *k))
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(Command::new(name).args(args))
}

fn strip_reply_line(config: &FramingConfig, bytes: &[u8]) -> Result<String, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::Malformed("reply is not valid UTF-8".into()))?;
    let text = text.trim_end_matches(config.reply_terminator);
    Ok(text.trim().to_string())
}

/// Match the configured device-error prefixes; `code` defaults to -1 when
/// the device gives none.
fn match_error(config: &FramingConfig, line: &str) -> Option<Reply> {
    let upper = line.to_ascii_uppercase();
    let prefix = config
        .error_prefixes
        .iter()
        .find(|p| upper.starts_with(&p.to_ascii_uppercase()))?;

    let rest = line[prefix.len()..].trim_start_matches(|c: char| c == ':' || c == ',' || c.is_whitespace());
    let digits_end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let (code, message) = match rest[..digits_end].parse::<i32>() {
        Ok(code) => (code, &rest[digits_end..]),
        Err(_) => (-1, rest),
    };
    let message = message
        .trim_start_matches(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .trim_matches('"')
        .to_string();
    Some(Reply::Error { code, message })
}

pub(super) fn parse(
    config: &FramingConfig,
    bytes: &[u8],
    shape: &ReplyShape,
) -> Result<Reply, CodecError> {
    if *shape == ReplyShape::Block {
        return parse_block(config, bytes);
    }

    let line = strip_reply_line(config, bytes)?;
    if let Some(error) = match_error(config, &line) {
        return Ok(error);
    }

    let line = match config.echo_separator {
        Some(sep) => line.rsplit(sep).next().unwrap_or(&line).trim().to_string(),
        None => line,
    };

    match shape {
        ReplyShape::None | ReplyShape::Ack => {
            let accepted = config.ack_tokens.is_empty()
                || config
                    .ack_tokens
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&line));
            if accepted {
                Ok(Reply::Ack)
            } else {
                Err(CodecError::Malformed(format!(
                    "expected acknowledgement, got '{line}'"
                )))
            }
        }
        _ => {
            if line.is_empty() {
                return Err(CodecError::Malformed("empty reply".into()));
            }
            parse_value(&line, shape).map(Reply::Value)
        }
    }
}

fn parse_value(text: &str, shape: &ReplyShape) -> Result<Value, CodecError> {
    let text = text.trim();
    match shape {
        ReplyShape::Auto => {
            if let Ok(v) = text.parse::<i64>() {
                Ok(Value::Int(v))
            } else if let Ok(v) = text.parse::<f64>() {
                Ok(Value::Float(v))
            } else {
                Ok(Value::Text(unquote(text)))
            }
        }
        ReplyShape::Text => Ok(Value::Text(unquote(text))),
        ReplyShape::Integer { radix } => parse_int(text, *radix).map(Value::Int),
        ReplyShape::Float => parse_float(text).map(Value::Float),
        ReplyShape::Fixed { scale, radix } => {
            parse_int(text, *radix).map(|count| Value::Float(fixed_to_float(count, *scale)))
        }
        ReplyShape::Bool => parse_bool(text).map(Value::Bool),
        ReplyShape::Fields { separator, fields } => {
            let parts: Vec<&str> = text.split(separator.as_str()).collect();
            if parts.len() < fields.len() {
                return Err(CodecError::Malformed(format!(
                    "short reply: {} of {} fields",
                    parts.len(),
                    fields.len()
                )));
            }
            if parts.len() > fields.len() {
                return Err(CodecError::Malformed(format!(
                    "reply has {} fields, expected {}",
                    parts.len(),
                    fields.len()
                )));
            }
            parts
                .iter()
                .zip(fields)
                .map(|(part, field)| parse_value(part, field))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
        ReplyShape::None | ReplyShape::Ack | ReplyShape::Block => Err(CodecError::Unsupported(
            format!("{shape:?} is not a field shape"),
        )),
    }
}

fn unquote(text: &str) -> String {
    match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => text.to_string(),
    }
}

/// Size of the whole block (header + data) if `bytes` starts with a complete
/// definite-length header.
pub(crate) fn block_len(bytes: &[u8]) -> Result<Option<usize>, CodecError> {
    if bytes.len() < 2 {
        return Ok(None);
    }
    if bytes[0] != b'#' {
        return Err(CodecError::Malformed("block does not start with '#'".into()));
    }
    let digits = (bytes[1] as char)
        .to_digit(10)
        .ok_or_else(|| CodecError::Malformed("invalid block header".into()))? as usize;
    if digits == 0 {
        return Ok(None);
    }
    if bytes.len() < 2 + digits {
        return Ok(None);
    }
    let len: usize = std::str::from_utf8(&bytes[2..2 + digits])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CodecError::Malformed("invalid block length".into()))?;
    Ok(Some(2 + digits + len))
}

fn parse_block(config: &FramingConfig, bytes: &[u8]) -> Result<Reply, CodecError> {
    if bytes.first() != Some(&b'#') {
        // Devices answer block queries with an error line when they refuse.
        let line = strip_reply_line(config, bytes)?;
        if let Some(error) = match_error(config, &line) {
            return Ok(error);
        }
        return Err(CodecError::Malformed("block does not start with '#'".into()));
    }
    if bytes.get(1) == Some(&b'0') {
        let data = &bytes[2..];
        let data = data
            .strip_suffix(&[config.reply_terminator as u8])
            .unwrap_or(data);
        return Ok(Reply::Value(Value::Bytes(data.to_vec())));
    }
    match block_len(bytes)? {
        Some(total) if bytes.len() >= total => {
            let digits = (bytes[1] - b'0') as usize;
            Ok(Reply::Value(Value::Bytes(bytes[2 + digits..total].to_vec())))
        }
        _ => Err(CodecError::Malformed("short block".into())),
    }
}

pub(super) fn encode_reply(
    config: &FramingConfig,
    reply: &Reply,
    shape: &ReplyShape,
) -> Result<Vec<u8>, CodecError> {
    let terminator = config.reply_terminator.to_string();
    match reply {
        Reply::Ack => {
            let token = config.ack_tokens.first().cloned().unwrap_or_default();
            Ok(format!("{token}{terminator}").into_bytes())
        }
        Reply::Error { code, message } => {
            let prefix = config
                .error_prefixes
                .last()
                .ok_or_else(|| CodecError::Unsupported("no error prefix configured".into()))?;
            let gap = if prefix.ends_with(':') { "" } else { " " };
            let mut line = format!("{prefix}{gap}{code}");
            if !message.is_empty() {
                line.push(' ');
                line.push_str(message);
            }
            line.push_str(&terminator);
            Ok(line.into_bytes())
        }
        Reply::Value(Value::Bytes(data)) if *shape == ReplyShape::Block => {
            let len = data.len().to_string();
            let mut out = format!("#{}{}", len.len(), len).into_bytes();
            out.extend_from_slice(data);
            out.extend_from_slice(terminator.as_bytes());
            Ok(out)
        }
        Reply::Value(value) => {
            let mut line = render_value(value, shape)?;
            line.push_str(&terminator);
            Ok(line.into_bytes())
        }
    }
}

fn render_value(value: &Value, shape: &ReplyShape) -> Result<String, CodecError> {
    match (shape, value) {
        (ReplyShape::Integer { radix }, Value::Int(v)) => format_int(*v, *radix),
        (ReplyShape::Fixed { scale, radix }, v) => {
            let number = v
                .as_f64()
                .ok_or_else(|| CodecError::InvalidArgument(format!("{v} is not numeric")))?;
            format_int(float_to_fixed(number, *scale)?, *radix)
        }
        (ReplyShape::Fields { separator, fields }, Value::List(items)) => {
            if items.len() != fields.len() {
                return Err(CodecError::InvalidArgument(format!(
                    "{} values for {} fields",
                    items.len(),
                    fields.len()
                )));
            }
            let parts = items
                .iter()
                .zip(fields)
                .map(|(item, field)| render_value(item, field))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts.join(separator))
        }
        (_, Value::Int(v)) => Ok(v.to_string()),
        (_, Value::Float(v)) => format_float(*v),
        (_, Value::Bool(b)) => Ok(if *b { "1" } else { "0" }.to_string()),
        (_, Value::Text(s)) => Ok(s.clone()),
        (_, other) => Err(CodecError::Unsupported(format!(
            "cannot render {other} as a {shape:?} line"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{FrameCodec, RawReply};
    use super::*;

    fn line() -> FrameCodec {
        FrameCodec::new(FramingConfig::line())
    }

    fn scpi() -> FrameCodec {
        FrameCodec::new(FramingConfig::scpi())
    }

    fn bytes(frame: Frame) -> Vec<u8> {
        match frame {
            Frame::Bytes(b) => b,
            Frame::Call(_) => panic!("expected byte frame"),
        }
    }

    #[test]
    fn test_line_encoding() {
        let cmd = Command::new("SET_POSITION").arg(10.0).arg(3).arg("a b").arg(true);
        assert_eq!(
            bytes(line().encode(&cmd).unwrap()),
            b"SET_POSITION 10.0 3 \"a b\" 1\n"
        );
    }

    #[test]
    fn test_scpi_encoding() {
        let cmd = Command::new("SOUR:VOLT").arg(1.5).arg("CH1").arg(false);
        assert_eq!(
            bytes(scpi().encode(&cmd).unwrap()),
            b"SOUR:VOLT 1.5,\"CH1\",OFF\n"
        );
        assert_eq!(bytes(scpi().encode(&Command::new("*IDN?")).unwrap()), b"*IDN?\n");
    }

    #[test]
    fn test_rejects_bad_commands() {
        assert!(line().encode(&Command::new("")).is_err());
        assert!(line().encode(&Command::new("A B")).is_err());
        assert!(line().encode(&Command::new("X").arg(f64::INFINITY)).is_err());
        assert!(line().encode(&Command::new("X").arg("two\nlines")).is_err());
    }

    #[test]
    fn test_command_round_trip_typed() {
        let kinds = [ArgKind::Float, ArgKind::Int, ArgKind::Text, ArgKind::Bool, ArgKind::Text];
        let cmd = Command::new("CONF")
            .arg(-0.125)
            .arg(42)
            .arg("say \"hi\", ok")
            .arg(true)
            .arg("");
        for codec in [line(), scpi()] {
            let frame = codec.encode(&cmd).unwrap();
            let decoded = codec.decode_command(&frame, &kinds).unwrap();
            assert_eq!(decoded.name(), cmd.name());
            assert_eq!(decoded.arguments(), cmd.arguments());
        }
    }

    #[test]
    fn test_command_inference() {
        let frame = Frame::Bytes(b"MOVE 10 2.5 fast\n".to_vec());
        let cmd = line().decode_command(&frame, &[]).unwrap();
        assert_eq!(
            cmd.arguments(),
            &[Arg::Int(10), Arg::Float(2.5), Arg::Text("fast".into())]
        );

        let frame = Frame::Bytes(b"OUTP ON\n".to_vec());
        let cmd = scpi().decode_command(&frame, &[]).unwrap();
        assert_eq!(cmd.arguments(), &[Arg::Bool(true)]);
    }

    #[test]
    fn test_argument_count_mismatch() {
        let frame = Frame::Bytes(b"MOVE 10\n".to_vec());
        let err = line()
            .decode_command(&frame, &[ArgKind::Int, ArgKind::Int])
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_decode_numeric_shapes() {
        let codec = line();
        let raw = |s: &str| RawReply::Bytes(s.as_bytes().to_vec());
        assert_eq!(
            codec.decode(&raw("10.0\r\n"), &ReplyShape::Float).unwrap(),
            Reply::Value(Value::Float(10.0))
        );
        assert_eq!(
            codec.decode(&raw("1F\n"), &ReplyShape::Integer { radix: 16 }).unwrap(),
            Reply::Value(Value::Int(31))
        );
        assert_eq!(
            codec
                .decode(&raw("2345\n"), &ReplyShape::Fixed { scale: 0.01, radix: 10 })
                .unwrap(),
            Reply::Value(Value::Float(23.45))
        );
        assert!(matches!(
            codec.decode(&raw("abc\n"), &ReplyShape::Float),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(&raw("\n"), &ReplyShape::Float),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_integer_replies_are_errors() {
        let codec = line();
        let raw = |s: &str| RawReply::Bytes(s.as_bytes().to_vec());
        assert!(matches!(
            codec.decode(&raw("5\n"), &ReplyShape::Integer { radix: 1 }),
            Err(CodecError::Unsupported(_))
        ));
        for reply in ["--5\n", "+-5\n", "--9223372036854775808\n"] {
            assert!(matches!(
                codec.decode(&raw(reply), &ReplyShape::Integer { radix: 10 }),
                Err(CodecError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_decode_fields() {
        let shape = ReplyShape::Fields {
            separator: ",".into(),
            fields: vec![
                ReplyShape::Text,
                ReplyShape::Text,
                ReplyShape::Text,
                ReplyShape::Text,
            ],
        };
        let reply = scpi()
            .decode(
                &RawReply::Bytes(b"Thorlabs,PM100USB,P2000123,1.6.0\n".to_vec()),
                &shape,
            )
            .unwrap();
        assert_eq!(
            reply,
            Reply::Value(Value::List(vec![
                Value::Text("Thorlabs".into()),
                Value::Text("PM100USB".into()),
                Value::Text("P2000123".into()),
                Value::Text("1.6.0".into()),
            ]))
        );

        let short = scpi().decode(&RawReply::Bytes(b"Thorlabs,PM100USB\n".to_vec()), &shape);
        assert!(matches!(short, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_device_error_tokens() {
        let codec = line();
        let err = codec
            .decode(
                &RawReply::Bytes(b"error:22 value out of range\n".to_vec()),
                &ReplyShape::Float,
            )
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::DeviceError {
                code: 22,
                message: "value out of range".into()
            }
        );

        let parsed = codec
            .parse(&RawReply::Bytes(b"ERROR\n".to_vec()), &ReplyShape::Ack)
            .unwrap();
        assert_eq!(
            parsed,
            Reply::Error {
                code: -1,
                message: String::new()
            }
        );
    }

    #[test]
    fn test_ack_tokens() {
        let codec = line();
        assert_eq!(
            codec.decode(&RawReply::Bytes(b"ok\r\n".to_vec()), &ReplyShape::Ack).unwrap(),
            Reply::Ack
        );
        assert!(codec
            .decode(&RawReply::Bytes(b"maybe\n".to_vec()), &ReplyShape::Ack)
            .is_err());

        let lenient = FrameCodec::new(FramingConfig::line().with_ack_tokens(Vec::<String>::new()));
        assert_eq!(
            lenient
                .decode(&RawReply::Bytes(b"laser enabled\n".to_vec()), &ReplyShape::Ack)
                .unwrap(),
            Reply::Ack
        );
    }

    #[test]
    fn test_echo_strip() {
        let codec = FrameCodec::new(FramingConfig::line().with_echo_separator(':'));
        assert_eq!(
            codec
                .decode(&RawReply::Bytes(b"WAVELENGTH:800\n".to_vec()), &ReplyShape::Auto)
                .unwrap(),
            Reply::Value(Value::Int(800))
        );
    }

    #[test]
    fn test_block_round_trip() {
        let codec = scpi();
        let data = vec![0u8, 1, 2, 10, 255];
        let raw = codec
            .encode_reply(&Reply::Value(Value::Bytes(data.clone())), &ReplyShape::Block)
            .unwrap();
        assert_eq!(
            raw,
            RawReply::Bytes(b"#15\x00\x01\x02\x0a\xff\n".to_vec())
        );
        assert_eq!(
            codec.decode(&raw, &ReplyShape::Block).unwrap(),
            Reply::Value(Value::Bytes(data))
        );
        assert!(codec
            .decode(&RawReply::Bytes(b"#210abc".to_vec()), &ReplyShape::Block)
            .is_err());
    }

    #[test]
    fn test_reply_round_trip() {
        let codec = line();
        let cases = [
            (Value::Float(10.0), ReplyShape::Float),
            (Value::Float(-3.75), ReplyShape::Auto),
            (Value::Int(-12), ReplyShape::Integer { radix: 10 }),
            (Value::Int(i64::MIN), ReplyShape::Integer { radix: 10 }),
            (Value::Int(i64::MIN), ReplyShape::Integer { radix: 16 }),
            (Value::Int(0x1A2B), ReplyShape::Integer { radix: 16 }),
            (Value::Float(23.45), ReplyShape::Fixed { scale: 0.01, radix: 10 }),
            (Value::Bool(true), ReplyShape::Bool),
            (Value::Text("Idle".into()), ReplyShape::Text),
        ];
        for (value, shape) in cases {
            let raw = codec.encode_reply(&Reply::Value(value.clone()), &shape).unwrap();
            assert_eq!(codec.decode(&raw, &shape).unwrap(), Reply::Value(value));
        }

        let error = Reply::Error {
            code: 9,
            message: "locked".into(),
        };
        let raw = codec.encode_reply(&error, &ReplyShape::Ack).unwrap();
        assert_eq!(codec.parse(&raw, &ReplyShape::Ack).unwrap(), error);
    }
}
