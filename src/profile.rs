//! Device profiles: data-driven command vocabularies.
//!
//! A profile names a device kind, its transport and framing, and the commands
//! it understands: wire name, argument shapes with ranges and unit
//! conversions, the expected reply shape, and per-command timeout/retry
//! overrides. The core never interprets physical units itself; profiles
//! convert caller values into device units before a [`Command`] is built.
//!
//! Profiles are plain TOML or JSON documents:
//!
//! ```toml
//! kind = "linear_stage"
//! transport = "serial"
//!
//! [framing]
//! framing = "line"
//! command_terminator = "\r\n"
//!
//! [commands.move_to]
//! wire_name = "MOVE"
//! args = [{ name = "position_mm", kind = "float", min = 0.0, max = 25.0 }]
//! reply = { type = "ack" }
//! timeout_ms = 5000
//!
//! [commands.position]
//! wire_name = "POS?"
//! reply = { type = "float" }
//! retry_count = 2
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{FrameCodec, Framing, FramingConfig, RADIX_RANGE};
use crate::command::{Arg, ArgKind, Command, Reply, ReplyShape, Value};
use crate::session::Session;
use crate::transport::TransportKind;

/// Failures loading profiles or building commands from them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProfileError {
    /// No profile registered under this device kind.
    #[error("Unknown device kind '{0}'")]
    UnknownKind(String),

    /// The profile has no command of this name.
    #[error("Device '{kind}' has no command '{command}'")]
    UnknownCommand {
        /// Device kind searched.
        kind: String,
        /// Command name requested.
        command: String,
    },

    /// Wrong number of caller arguments.
    #[error("Command '{command}' takes {expected} argument(s), got {got}")]
    ArgumentCount {
        /// Profile command name.
        command: String,
        /// Arguments the profile declares.
        expected: usize,
        /// Arguments supplied.
        got: usize,
    },

    /// An argument cannot be converted to its declared kind.
    #[error("Argument '{arg}' of '{command}' must be {expected:?}, got {got}")]
    ArgumentKind {
        /// Profile command name.
        command: String,
        /// Argument name.
        arg: String,
        /// Declared wire kind.
        expected: ArgKind,
        /// Rendering of the rejected value.
        got: String,
    },

    /// A numeric argument lies outside its declared range.
    #[error("Argument '{arg}' of '{command}' is {value}, outside [{min}, {max}]")]
    OutOfRange {
        /// Profile command name.
        command: String,
        /// Argument name.
        arg: String,
        /// Supplied physical value.
        value: f64,
        /// Lower bound, or negative infinity.
        min: f64,
        /// Upper bound, or infinity.
        max: f64,
    },

    /// A profile with this kind is already registered.
    #[error("Device kind '{0}' is already registered")]
    Duplicate(String),

    /// The profile parsed but is inconsistent.
    #[error("Invalid profile '{kind}': {reason}")]
    Invalid {
        /// Device kind of the profile.
        kind: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The document is not valid TOML or JSON for a profile.
    #[error("Failed to parse profile: {0}")]
    Parse(String),
}

/// Linear map between physical and device units:
/// `device = physical * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitConversion {
    /// Device units per physical unit; non-zero.
    pub scale: f64,
    /// Device value at physical zero.
    #[serde(default)]
    pub offset: f64,
}

impl UnitConversion {
    /// Physical value to device units.
    pub fn to_device(&self, physical: f64) -> f64 {
        physical * self.scale + self.offset
    }

    /// Device units back to the physical value.
    pub fn to_physical(&self, device: f64) -> f64 {
        (device - self.offset) / self.scale
    }
}

/// One caller-supplied argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Name used in error messages.
    pub name: String,
    /// Type on the wire, after unit conversion.
    pub kind: ArgKind,
    /// Inclusive physical range.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive physical upper bound.
    #[serde(default)]
    pub max: Option<f64>,
    /// Applied after the range check.
    #[serde(default)]
    pub unit: Option<UnitConversion>,
}

/// One named command of a device profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Name sent to the device; defaults to the profile's command name.
    #[serde(default)]
    pub wire_name: Option<String>,
    /// Constant arguments placed before the caller's (e.g. a register number).
    #[serde(default)]
    pub fixed_args: Vec<Arg>,
    /// Caller arguments, in order.
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// Expected reply; none means fire-and-forget.
    #[serde(default)]
    pub reply: ReplyShape,
    /// Converts numeric replies back to physical units.
    #[serde(default)]
    pub reply_unit: Option<UnitConversion>,
    /// Reply timeout override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry count override.
    #[serde(default)]
    pub retry_count: Option<u32>,
}

/// Command vocabulary and wire settings of one device kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Registry key, e.g. `linear_stage`.
    pub kind: String,
    /// Free text for humans.
    #[serde(default)]
    pub description: Option<String>,
    /// Transport the device is reached over.
    pub transport: TransportKind,
    /// Wire syntax; the transport's default framing when absent.
    #[serde(default)]
    pub framing: Option<FramingConfig>,
    /// Identification command: a key of `commands` or a bare query name.
    #[serde(default)]
    pub identify: Option<String>,
    /// Commands by profile name.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,
}

/// Document format of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFormat {
    /// `.toml` documents.
    Toml,
    /// `.json` documents.
    Json,
}

impl ProfileFormat {
    /// Format implied by the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "toml" => Some(ProfileFormat::Toml),
            "json" => Some(ProfileFormat::Json),
            _ => None,
        }
    }
}

impl DeviceProfile {
    /// Parse and validate a profile document.
    pub fn parse(document: &str, format: ProfileFormat) -> Result<Self, ProfileError> {
        let profile: Self = match format {
            ProfileFormat::Toml => {
                toml::from_str(document).map_err(|e| ProfileError::Parse(e.to_string()))?
            }
            ProfileFormat::Json => {
                serde_json::from_str(document).map_err(|e| ProfileError::Parse(e.to_string()))?
            }
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Check internal consistency: framing against transport, argument
    /// ranges, unit scales and reply shapes the codec can decode.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let invalid = |reason: String| ProfileError::Invalid {
            kind: self.kind.clone(),
            reason,
        };
        if self.kind.trim().is_empty() {
            return Err(invalid("empty device kind".into()));
        }
        let framing = self.framing_config().framing;
        if (framing == Framing::Call) != (self.transport == TransportKind::Native) {
            return Err(invalid(format!(
                "{framing:?} framing does not fit a {} transport",
                self.transport
            )));
        }
        for (name, spec) in &self.commands {
            if name.trim().is_empty() {
                return Err(invalid("command with empty name".into()));
            }
            for arg in &spec.args {
                if let (Some(min), Some(max)) = (arg.min, arg.max) {
                    if min > max {
                        return Err(invalid(format!(
                            "{name}.{}: min {min} exceeds max {max}",
                            arg.name
                        )));
                    }
                }
                if arg.unit.is_some_and(|u| u.scale == 0.0 || !u.scale.is_finite()) {
                    return Err(invalid(format!("{name}.{}: unit scale must be non-zero", arg.name)));
                }
            }
            if spec.reply_unit.is_some_and(|u| u.scale == 0.0 || !u.scale.is_finite()) {
                return Err(invalid(format!("{name}: reply unit scale must be non-zero")));
            }
            check_reply_shape(&spec.reply).map_err(|reason| invalid(format!("{name}: {reason}")))?;
        }
        if let Some(identify) = &self.identify {
            if let Some(spec) = self.commands.get(identify) {
                if !spec.args.is_empty() {
                    return Err(invalid(format!(
                        "identify command '{identify}' must not take arguments"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Declared framing, or the transport's default.
    pub fn framing_config(&self) -> FramingConfig {
        self.framing
            .clone()
            .unwrap_or_else(|| FramingConfig::for_kind(self.transport))
    }

    /// Codec for this device's framing.
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.framing_config())
    }

    /// Look up a command spec by profile name.
    pub fn spec(&self, name: &str) -> Result<&CommandSpec, ProfileError> {
        self.commands
            .get(name)
            .ok_or_else(|| ProfileError::UnknownCommand {
                kind: self.kind.clone(),
                command: name.to_string(),
            })
    }

    /// Build a ready-to-send command from physical argument values.
    ///
    /// Arguments are range-checked in physical units, converted to device
    /// units and coerced to the wire kind.
    pub fn command(&self, name: &str, args: &[Arg]) -> Result<Command, ProfileError> {
        let spec = self.spec(name)?;
        if args.len() != spec.args.len() {
            return Err(ProfileError::ArgumentCount {
                command: name.to_string(),
                expected: spec.args.len(),
                got: args.len(),
            });
        }

        let mut converted = spec.fixed_args.clone();
        for (arg, arg_spec) in args.iter().zip(&spec.args) {
            converted.push(convert_arg(name, arg_spec, arg)?);
        }

        let mut command = Command::new(spec.wire_name.as_deref().unwrap_or(name))
            .args(converted)
            .with_reply(spec.reply.clone());
        if let Some(ms) = spec.timeout_ms {
            command = command.with_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = spec.retry_count {
            command = command.with_retries(retries);
        }
        Ok(command)
    }

    /// Convert a reply to `name` back into physical units.
    pub fn to_physical(&self, name: &str, reply: Reply) -> Result<Reply, ProfileError> {
        let spec = self.spec(name)?;
        Ok(match (spec.reply_unit, reply) {
            (Some(unit), Reply::Value(value)) => Reply::Value(value_to_physical(&unit, value)),
            (_, reply) => reply,
        })
    }

    /// The identification command this profile declares, if any.
    pub fn identify_command(&self) -> Option<Command> {
        let name = self.identify.as_deref()?;
        match self.commands.get(name) {
            Some(_) => self.command(name, &[]).ok(),
            None => Some(Command::query(name, ReplyShape::Text)),
        }
    }

    /// Apply this profile's codec and identification command to a session.
    pub fn configure(&self, session: Session) -> Session {
        if session.config().transport != self.transport {
            warn!(
                kind = %self.kind,
                profile_transport = %self.transport,
                session_transport = %session.config().transport,
                "Profile transport differs from session transport"
            );
        }
        let session = session.with_codec(self.codec());
        match self.identify_command() {
            Some(command) => session.with_identify_command(command),
            None => session,
        }
    }
}

/// Reject reply shapes the codec cannot decode.
fn check_reply_shape(shape: &ReplyShape) -> Result<(), String> {
    let check_radix = |radix: u32| {
        if RADIX_RANGE.contains(&radix) {
            Ok(())
        } else {
            Err(format!("reply radix {radix} outside 2..=36"))
        }
    };
    match shape {
        ReplyShape::Integer { radix } => check_radix(*radix),
        ReplyShape::Fixed { scale, radix } => {
            if *scale == 0.0 || !scale.is_finite() {
                return Err(format!("fixed-point scale {scale} must be finite and non-zero"));
            }
            check_radix(*radix)
        }
        ReplyShape::Fields { separator, fields } => {
            if separator.is_empty() {
                return Err("empty field separator".into());
            }
            fields.iter().try_for_each(check_reply_shape)
        }
        _ => Ok(()),
    }
}

fn arg_label(arg: &Arg) -> String {
    format!("{:?} {arg:?}", arg.kind())
}

fn convert_arg(command: &str, spec: &ArgSpec, arg: &Arg) -> Result<Arg, ProfileError> {
    let kind_error = || ProfileError::ArgumentKind {
        command: command.to_string(),
        arg: spec.name.clone(),
        expected: spec.kind,
        got: arg_label(arg),
    };

    match spec.kind {
        ArgKind::Text => match arg {
            Arg::Text(_) => Ok(arg.clone()),
            _ => Err(kind_error()),
        },
        ArgKind::Bool => match arg {
            Arg::Bool(_) => Ok(arg.clone()),
            Arg::Int(0) => Ok(Arg::Bool(false)),
            Arg::Int(1) => Ok(Arg::Bool(true)),
            _ => Err(kind_error()),
        },
        ArgKind::Int | ArgKind::Float => {
            let physical = match arg {
                Arg::Int(_) | Arg::Float(_) => arg.as_f64().ok_or_else(kind_error)?,
                _ => return Err(kind_error()),
            };
            if !physical.is_finite() {
                return Err(kind_error());
            }
            let min = spec.min.unwrap_or(f64::NEG_INFINITY);
            let max = spec.max.unwrap_or(f64::INFINITY);
            if physical < min || physical > max {
                return Err(ProfileError::OutOfRange {
                    command: command.to_string(),
                    arg: spec.name.clone(),
                    value: physical,
                    min,
                    max,
                });
            }

            match (spec.kind, spec.unit, arg) {
                (ArgKind::Int, None, Arg::Int(v)) => Ok(Arg::Int(*v)),
                (ArgKind::Int, None, Arg::Float(v)) if v.fract() == 0.0 => Ok(Arg::Int(*v as i64)),
                (ArgKind::Int, None, _) => Err(kind_error()),
                (ArgKind::Int, Some(unit), _) => Ok(Arg::Int(unit.to_device(physical).round() as i64)),
                (_, Some(unit), _) => Ok(Arg::Float(unit.to_device(physical))),
                (_, None, _) => Ok(Arg::Float(physical)),
            }
        }
    }
}

fn value_to_physical(unit: &UnitConversion, value: Value) -> Value {
    match value {
        Value::Int(v) => Value::Float(unit.to_physical(v as f64)),
        Value::Float(v) => Value::Float(unit.to_physical(v)),
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| value_to_physical(unit, item))
                .collect(),
        ),
        other => other,
    }
}

/// Device kind -> profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<DeviceProfile>>,
}

impl ProfileRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a profile. Kinds are unique.
    pub fn register(&mut self, profile: DeviceProfile) -> Result<Arc<DeviceProfile>, ProfileError> {
        profile.validate()?;
        if self.profiles.contains_key(&profile.kind) {
            return Err(ProfileError::Duplicate(profile.kind));
        }
        let kind = profile.kind.clone();
        let profile = Arc::new(profile);
        self.profiles.insert(kind.clone(), profile.clone());
        debug!(%kind, commands = profile.commands.len(), "Registered device profile");
        Ok(profile)
    }

    /// Profile registered for `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<DeviceProfile>, ProfileError> {
        self.profiles
            .get(kind)
            .cloned()
            .ok_or_else(|| ProfileError::UnknownKind(kind.to_string()))
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.profiles.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Number of registered profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether no profile is registered.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Build a command for device `kind`.
    pub fn command(&self, kind: &str, name: &str, args: &[Arg]) -> Result<Command, ProfileError> {
        self.get(kind)?.command(name, args)
    }

    /// Parse and register one profile document.
    pub fn load_str(
        &mut self,
        document: &str,
        format: ProfileFormat,
    ) -> Result<Arc<DeviceProfile>, ProfileError> {
        self.register(DeviceProfile::parse(document, format)?)
    }

    /// Load one `.toml` or `.json` profile file.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<Arc<DeviceProfile>> {
        let path = path.as_ref();
        let format = ProfileFormat::from_path(path).with_context(|| {
            format!("Unrecognised profile extension: {}", path.display())
        })?;
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        let profile = self
            .load_str(&document, format)
            .with_context(|| format!("Failed to load profile {}", path.display()))?;
        Ok(profile)
    }

    /// Load every `.toml`/`.json` file in `dir` (not recursive). Returns the
    /// number of profiles loaded.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read profile directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && ProfileFormat::from_path(path).is_some())
            .collect();
        paths.sort();

        for path in &paths {
            self.load_file(path)?;
        }
        debug!(dir = %dir.display(), count = paths.len(), "Loaded profile directory");
        Ok(paths.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGE: &str = r#"
kind = "linear_stage"
transport = "serial"
identify = "*IDN?"

[commands.move_to]
wire_name = "MOVE"
args = [{ name = "position_mm", kind = "float", min = 0.0, max = 25.0 }]
reply = { type = "ack" }
timeout_ms = 5000

[commands.position]
wire_name = "POS?"
reply = { type = "float" }
retry_count = 2
"#;

    const LASER: &str = r#"
kind = "itla"
transport = "serial"

[framing]
framing = "register"

[commands.set_power]
wire_name = "WRITE"
fixed_args = [49]
args = [{ name = "power_dbm", kind = "int", min = 6.0, max = 13.5, unit = { scale = 100.0 } }]

[commands.temperature]
wire_name = "READ"
fixed_args = [67]
reply = { type = "integer" }
reply_unit = { scale = 100.0 }
"#;

    #[test]
    fn test_command_from_profile() {
        let profile = DeviceProfile::parse(STAGE, ProfileFormat::Toml).unwrap();
        let cmd = profile.command("move_to", &[Arg::Float(12.5)]).unwrap();
        assert_eq!(cmd.name(), "MOVE");
        assert_eq!(cmd.arguments(), &[Arg::Float(12.5)]);
        assert_eq!(cmd.reply_shape(), &ReplyShape::Ack);
        assert_eq!(cmd.timeout_override(), Some(Duration::from_millis(5000)));

        let pos = profile.command("position", &[]).unwrap();
        assert_eq!(pos.retry_override(), Some(2));
        assert!(pos.expects_reply());
    }

    #[test]
    fn test_argument_validation() {
        let profile = DeviceProfile::parse(STAGE, ProfileFormat::Toml).unwrap();
        assert!(matches!(
            profile.command("move_to", &[Arg::Float(30.0)]),
            Err(ProfileError::OutOfRange { max, .. }) if max == 25.0
        ));
        assert!(matches!(
            profile.command("move_to", &[]),
            Err(ProfileError::ArgumentCount { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            profile.command("move_to", &[Arg::Text("far".into())]),
            Err(ProfileError::ArgumentKind { .. })
        ));
        assert!(matches!(
            profile.command("jump", &[]),
            Err(ProfileError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_unit_conversion_both_ways() {
        let profile = DeviceProfile::parse(LASER, ProfileFormat::Toml).unwrap();
        let cmd = profile.command("set_power", &[Arg::Float(10.0)]).unwrap();
        assert_eq!(cmd.name(), "WRITE");
        assert_eq!(cmd.arguments(), &[Arg::Int(49), Arg::Int(1000)]);

        let reply = profile
            .to_physical("temperature", Reply::Value(Value::Int(2550)))
            .unwrap();
        assert_eq!(reply, Reply::Value(Value::Float(25.5)));
        assert_eq!(
            profile.to_physical("set_power", Reply::Ack).unwrap(),
            Reply::Ack
        );
    }

    #[test]
    fn test_int_argument_without_unit_must_be_integral() {
        let spec = ArgSpec {
            name: "axis".into(),
            kind: ArgKind::Int,
            min: None,
            max: None,
            unit: None,
        };
        assert_eq!(convert_arg("home", &spec, &Arg::Float(2.0)).unwrap(), Arg::Int(2));
        assert!(convert_arg("home", &spec, &Arg::Float(2.5)).is_err());
    }

    #[test]
    fn test_invalid_profiles_rejected() {
        let call_on_serial = "kind = \"x\"\ntransport = \"serial\"\n[framing]\nframing = \"call\"\n";
        assert!(matches!(
            DeviceProfile::parse(call_on_serial, ProfileFormat::Toml),
            Err(ProfileError::Invalid { .. })
        ));
        let inverted = r#"
kind = "x"
transport = "serial"
[commands.go]
args = [{ name = "a", kind = "float", min = 5.0, max = 1.0 }]
"#;
        assert!(DeviceProfile::parse(inverted, ProfileFormat::Toml).is_err());
        assert!(matches!(
            DeviceProfile::parse("{", ProfileFormat::Json),
            Err(ProfileError::Parse(_))
        ));
    }

    #[test]
    fn test_undecodable_reply_shapes_rejected() {
        let doc = |reply: &str| {
            format!("kind = \"x\"\ntransport = \"serial\"\n[commands.q]\nreply = {reply}\n")
        };
        for reply in [
            r#"{ type = "integer", radix = 1 }"#,
            r#"{ type = "integer", radix = 37 }"#,
            r#"{ type = "fixed", scale = 0.0 }"#,
            r#"{ type = "fields", separator = ",", fields = [{ type = "text" }, { type = "integer", radix = 0 }] }"#,
        ] {
            assert!(
                matches!(
                    DeviceProfile::parse(&doc(reply), ProfileFormat::Toml),
                    Err(ProfileError::Invalid { .. })
                ),
                "{reply}"
            );
        }
        assert!(DeviceProfile::parse(&doc(r#"{ type = "integer", radix = 16 }"#), ProfileFormat::Toml).is_ok());
    }

    #[test]
    fn test_identify_command_resolution() {
        let profile = DeviceProfile::parse(STAGE, ProfileFormat::Toml).unwrap();
        let identify = profile.identify_command().unwrap();
        assert_eq!(identify.name(), "*IDN?");
        assert_eq!(identify.reply_shape(), &ReplyShape::Text);

        let laser = DeviceProfile::parse(LASER, ProfileFormat::Toml).unwrap();
        assert!(laser.identify_command().is_none());
        assert_eq!(laser.codec().framing(), Framing::Register);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = ProfileRegistry::new();
        registry.load_str(STAGE, ProfileFormat::Toml).unwrap();
        assert!(matches!(
            registry.load_str(STAGE, ProfileFormat::Toml),
            Err(ProfileError::Duplicate(kind)) if kind == "linear_stage"
        ));
        assert!(matches!(
            registry.get("spectrometer"),
            Err(ProfileError::UnknownKind(_))
        ));
        let cmd = registry
            .command("linear_stage", "move_to", &[Arg::Float(1.0)])
            .unwrap();
        assert_eq!(cmd.name(), "MOVE");
    }
}
