//! Native-call framing: a command becomes a function name plus its ordered
//! arguments; the reply is the list of output values the call produced.

use crate::command::{Command, Reply, ReplyShape, Value};
use crate::error::CodecError;

use super::{fixed_to_float, float_to_fixed, FramingConfig, Frame, NativeCall};

pub(super) fn encode(config: &FramingConfig, command: &Command) -> Frame {
    Frame::Call(NativeCall {
        function: format!("{}{}", config.function_prefix, command.name()),
        args: command.arguments().to_vec(),
    })
}

pub(super) fn decode_command(config: &FramingConfig, call: &NativeCall) -> Result<Command, CodecError> {
    let name = call
        .function
        .strip_prefix(config.function_prefix.as_str())
        .ok_or_else(|| {
            CodecError::Malformed(format!(
                "function '{}' lacks prefix '{}'",
                call.function, config.function_prefix
            ))
        })?;
    Ok(Command::new(name).args(call.args.iter().cloned()))
}

fn coerce(value: &Value, shape: &ReplyShape) -> Result<Value, CodecError> {
    let mismatch = || CodecError::Malformed(format!("output {value:?} does not match {shape:?}"));
    Ok(match (shape, value) {
        (ReplyShape::Auto, v) => v.clone(),
        (ReplyShape::Text, Value::Text(s)) => Value::Text(s.clone()),
        (ReplyShape::Integer { .. }, Value::Int(v)) => Value::Int(*v),
        (ReplyShape::Float, v) => Value::Float(v.as_f64().ok_or_else(mismatch)?),
        (ReplyShape::Fixed { scale, .. }, Value::Int(count)) => {
            Value::Float(fixed_to_float(*count, *scale))
        }
        (ReplyShape::Fixed { .. }, Value::Float(v)) => Value::Float(*v),
        (ReplyShape::Bool, Value::Bool(b)) => Value::Bool(*b),
        (ReplyShape::Bool, Value::Int(v)) => Value::Bool(*v != 0),
        (ReplyShape::Block, Value::Bytes(b)) => Value::Bytes(b.clone()),
        _ => return Err(mismatch()),
    })
}

pub(super) fn parse(outputs: &[Value], shape: &ReplyShape) -> Result<Reply, CodecError> {
    match shape {
        ReplyShape::None | ReplyShape::Ack => Ok(Reply::Ack),
        ReplyShape::Fields { fields, .. } => {
            if outputs.len() < fields.len() {
                return Err(CodecError::Malformed(format!(
                    "call returned {} of {} outputs",
                    outputs.len(),
                    fields.len()
                )));
            }
            outputs
                .iter()
                .zip(fields)
                .map(|(v, f)| coerce(v, f))
                .collect::<Result<Vec<_>, _>>()
                .map(|items| Reply::Value(Value::List(items)))
        }
        scalar => {
            let first = outputs
                .first()
                .ok_or_else(|| CodecError::Malformed("call returned no outputs".into()))?;
            coerce(first, scalar).map(Reply::Value)
        }
    }
}

pub(super) fn encode_reply(reply: &Reply, shape: &ReplyShape) -> Result<Vec<Value>, CodecError> {
    match (reply, shape) {
        (Reply::Ack, _) => Ok(Vec::new()),
        (Reply::Error { .. }, _) => Err(CodecError::Unsupported(
            "native calls report errors through their status code".into(),
        )),
        (Reply::Value(Value::List(items)), ReplyShape::Fields { .. }) => Ok(items.clone()),
        (Reply::Value(v), ReplyShape::Fixed { scale, .. }) => {
            let number = v
                .as_f64()
                .ok_or_else(|| CodecError::InvalidArgument(format!("{v} is not numeric")))?;
            Ok(vec![Value::Int(float_to_fixed(number, *scale)?)])
        }
        (Reply::Value(v), _) => Ok(vec![v.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{FrameCodec, RawReply};
    use super::*;
    use crate::command::Arg;

    #[test]
    fn test_call_round_trip() {
        let codec = FrameCodec::new(FramingConfig::call("TLPM_"));
        let cmd = Command::new("setWavelength").arg(1550.0);
        let frame = codec.encode(&cmd).unwrap();
        assert_eq!(
            frame,
            Frame::Call(NativeCall {
                function: "TLPM_setWavelength".into(),
                args: vec![Arg::Float(1550.0)],
            })
        );
        let decoded = codec.decode_command(&frame, &[]).unwrap();
        assert_eq!(decoded.name(), "setWavelength");
        assert_eq!(decoded.arguments(), cmd.arguments());
    }

    #[test]
    fn test_outputs_map_onto_shape() {
        let codec = FrameCodec::new(FramingConfig::call(""));
        let reply = codec
            .decode(&RawReply::Native(vec![Value::Float(1.2e-3)]), &ReplyShape::Float)
            .unwrap();
        assert_eq!(reply, Reply::Value(Value::Float(1.2e-3)));

        let empty = codec.decode(&RawReply::Native(vec![]), &ReplyShape::Float);
        assert!(matches!(empty, Err(CodecError::Malformed(_))));

        let wrong = codec.decode(&RawReply::Native(vec![Value::Text("x".into())]), &ReplyShape::Float);
        assert!(matches!(wrong, Err(CodecError::Malformed(_))));
    }
}
