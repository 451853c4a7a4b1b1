//! Device profiles loaded from disk and driven through sessions.

use std::fs;
use std::time::Duration;

use rust_instrument::transport::{MockResponse, MockTransport, ResourceRegistry};
use rust_instrument::{
    Arg, ArgKind, Command, DeviceState, FrameCodec, FramingConfig, ProfileError,
    ProfileFormat, ProfileRegistry, Reply, ReplyShape, Session, SessionConfig, Value,
};

const STAGE_TOML: &str = r#"
kind = "linear_stage"
description = "Single axis stage, millimetres"
transport = "serial"
identify = "*IDN?"

[framing]
framing = "line"
command_terminator = "\r\n"
reply_terminator = "\n"

[commands.move_to]
wire_name = "MOVE"
args = [{ name = "position_mm", kind = "int", min = 0.0, max = 25.0, unit = { scale = 1000.0 } }]
reply = { type = "ack" }
timeout_ms = 2000

[commands.position]
wire_name = "POS?"
reply = { type = "integer" }
reply_unit = { scale = 1000.0 }
retry_count = 1
"#;

const LASER_JSON: &str = r#"{
  "kind": "itla",
  "transport": "serial",
  "framing": { "framing": "register" },
  "commands": {
    "set_power": {
      "wire_name": "WRITE",
      "fixed_args": [49],
      "args": [{ "name": "power_dbm", "kind": "int", "min": 6.0, "max": 13.5, "unit": { "scale": 100.0 } }]
    }
  }
}"#;

#[test]
fn load_directory_of_profiles() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("stage.toml"), STAGE_TOML).unwrap();
    fs::write(dir.path().join("laser.json"), LASER_JSON).unwrap();
    fs::write(dir.path().join("README.md"), "not a profile").unwrap();

    let mut registry = ProfileRegistry::new();
    assert_eq!(registry.load_dir(dir.path()).unwrap(), 2);
    assert_eq!(registry.kinds(), vec!["itla", "linear_stage"]);

    let cmd = registry
        .command("itla", "set_power", &[Arg::Float(10.0)])
        .unwrap();
    assert_eq!(cmd.arguments(), &[Arg::Int(49), Arg::Int(1000)]);
}

#[test]
fn broken_profile_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "kind = \"x\"\ntransport = \"telegraph\"\n").unwrap();

    let err = ProfileRegistry::new().load_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
    assert!(matches!(
        err.downcast_ref::<ProfileError>(),
        Some(ProfileError::Parse(_))
    ));
}

#[tokio::test]
async fn profile_drives_a_session() {
    let mut registry = ProfileRegistry::new();
    let profile = registry
        .load_str(STAGE_TOML, ProfileFormat::Toml)
        .unwrap();

    let mut position_um = 0i64;
    let device = move |cmd: &Command| match cmd.name() {
        "MOVE" => {
            position_um = cmd.arguments().first().and_then(|a| match a {
                Arg::Int(v) => Some(*v),
                _ => None,
            }).unwrap_or(position_um);
            MockResponse::ack()
        }
        "POS?" => MockResponse::value(position_um),
        "*IDN?" => MockResponse::line("Acme,LS-25,0042,1.0"),
        _ => MockResponse::error(1, "unknown"),
    };
    let transport = MockTransport::new("/dev/ttyPROFILE0", profile.codec(), device);
    let probe = transport.probe();
    let session = profile.configure(
        Session::with_transport(SessionConfig::serial("/dev/ttyPROFILE0", 115200), Box::new(transport))
            .with_registry(ResourceRegistry::new()),
    );
    session.connect().await.unwrap();
    assert_eq!(session.identify().await.unwrap().model, "LS-25");

    let move_to = profile.command("move_to", &[Arg::Float(12.345)]).unwrap();
    assert_eq!(move_to.timeout_override(), Some(Duration::from_millis(2000)));
    assert_eq!(session.execute(&move_to).await.unwrap(), Reply::Ack);

    let raw = session
        .execute(&profile.command("position", &[]).unwrap())
        .await
        .unwrap();
    assert_eq!(raw, Reply::Value(Value::Int(12345)));
    let physical = profile.to_physical("position", raw).unwrap();
    assert_eq!(physical, Reply::Value(Value::Float(12.345)));

    assert_eq!(
        probe.frames()[1].as_bytes(),
        Some(&b"MOVE 12345\r\n"[..])
    );

    // Out-of-range values never reach the wire.
    let writes = probe.write_count();
    assert!(matches!(
        profile.command("move_to", &[Arg::Float(-1.0)]),
        Err(ProfileError::OutOfRange { .. })
    ));
    assert_eq!(probe.write_count(), writes);
    assert_eq!(session.state(), DeviceState::Identified);
}

#[tokio::test]
async fn register_profile_round_trip_through_mock() {
    let mut registry = ProfileRegistry::new();
    let profile = registry
        .load_str(LASER_JSON, ProfileFormat::Json)
        .unwrap();
    let transport = MockTransport::new("/dev/ttyITLA", profile.codec(), |cmd: &Command| {
        match cmd.arguments() {
            [Arg::Int(0x31), Arg::Int(value)] if (600..=1350).contains(value) => {
                MockResponse::value(*value)
            }
            _ => MockResponse::error(3, "execution error"),
        }
    });
    let session = profile.configure(
        Session::with_transport(SessionConfig::serial("/dev/ttyITLA", 9600), Box::new(transport))
            .with_registry(ResourceRegistry::new()),
    );
    session.connect().await.unwrap();

    let cmd = profile
        .command("set_power", &[Arg::Float(10.0)])
        .unwrap()
        .with_reply(ReplyShape::Integer { radix: 10 });
    assert_eq!(
        session.execute(&cmd).await.unwrap(),
        Reply::Value(Value::Int(1000))
    );
    // Register framing has no identification query.
    assert!(session.identify().await.is_err());
    assert_eq!(session.state(), DeviceState::Connected);
}

#[test]
fn commands_round_trip_for_every_framing() {
    let cases = [
        (
            FramingConfig::line(),
            Command::new("MOVE").arg(10.0).arg(2),
            vec![ArgKind::Float, ArgKind::Int],
        ),
        (
            FramingConfig::scpi(),
            Command::new("SOUR:VOLT").arg(1.5).arg(true).arg("CH1"),
            vec![ArgKind::Float, ArgKind::Bool, ArgKind::Text],
        ),
        (
            FramingConfig::register(),
            Command::new("WRITE").arg(0x31).arg(1000),
            vec![],
        ),
        (
            FramingConfig::call("TLPM_"),
            Command::new("setWavelength").arg(1550.0),
            vec![],
        ),
    ];
    for (config, command, kinds) in cases {
        let codec = FrameCodec::new(config);
        let frame = codec.encode(&command).unwrap();
        let decoded = codec.decode_command(&frame, &kinds).unwrap();
        assert_eq!(decoded.name(), command.name(), "{:?}", codec.framing());
        assert_eq!(decoded.arguments(), command.arguments(), "{:?}", codec.framing());
    }
}
