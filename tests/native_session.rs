//! Sessions over a native (vendor library) transport.

use std::sync::Arc;
use std::time::Duration;

use rust_instrument::transport::{MockLibrary, NativeOutcome, NativeTransport, ResourceRegistry};
use rust_instrument::{
    Command, CommandError, DeviceState, FrameCodec, FramingConfig, NativeCall, Reply, ReplyShape,
    Session, SessionConfig, SessionError, TransportError, Value,
};

const RESOURCE: &str = "USB0::0x1313::0x8078::P0005003::INSTR";
const VI_ERROR_INV_PARAMETER: i32 = -1073807240;

fn power_meter() -> MockLibrary {
    MockLibrary::new("TLPM", |call: &NativeCall| match call.function.as_str() {
        "TLPM_identificationQuery" => NativeOutcome::ok(vec![
            Value::Text("Thorlabs".into()),
            Value::Text("PM100D".into()),
            Value::Text("P0005003".into()),
            Value::Text("2.6.0".into()),
        ]),
        "TLPM_measPower" => NativeOutcome::ok(vec![Value::Float(0.0012)]),
        "TLPM_setWavelength" => match call.args.first().and_then(|a| a.as_f64()) {
            Some(nm) if (400.0..=1100.0).contains(&nm) => NativeOutcome::ok(Vec::new()),
            _ => NativeOutcome::status(VI_ERROR_INV_PARAMETER),
        },
        _ => NativeOutcome::status(-1),
    })
    .with_message(VI_ERROR_INV_PARAMETER, "Parameter out of range")
}

fn native_session(library: Arc<MockLibrary>, registry: ResourceRegistry) -> Session {
    let transport = NativeTransport::new(library, RESOURCE, Duration::from_secs(1));
    Session::with_transport(SessionConfig::native(RESOURCE), Box::new(transport))
        .with_codec(FrameCodec::new(FramingConfig::call("TLPM_")))
        .with_registry(registry)
}

#[tokio::test]
async fn identify_and_measure() {
    let library = Arc::new(power_meter());
    let session = native_session(library.clone(), ResourceRegistry::new());
    session.connect().await.unwrap();
    assert_eq!(library.open_count(), 1);

    let identity = session.identify().await.unwrap();
    assert_eq!(identity.model, "PM100D");
    assert_eq!(identity.firmware, "2.6.0");

    let power = session
        .execute(&Command::query("measPower", ReplyShape::Float))
        .await
        .unwrap();
    assert_eq!(power, Reply::Value(Value::Float(0.0012)));

    let set = session
        .execute(&Command::new("setWavelength").arg(780.0))
        .await
        .unwrap();
    assert_eq!(set, Reply::Ack);
    assert_eq!(
        library.calls().last().map(|c| c.function.clone()),
        Some("TLPM_setWavelength".to_string())
    );
}

#[tokio::test]
async fn negative_status_carries_library_message() {
    let library = Arc::new(power_meter());
    let session = native_session(library.clone(), ResourceRegistry::new());
    session.connect().await.unwrap();

    let err = session
        .execute(&Command::new("setWavelength").arg(2000.0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CommandError::Transport(TransportError::Native {
            code: VI_ERROR_INV_PARAMETER,
            message: Some("Parameter out of range".into()),
        })
    );
    assert_eq!(session.state(), DeviceState::Faulted);

    assert_eq!(session.reset().await.unwrap(), DeviceState::Connected);
    session
        .execute(&Command::new("setWavelength").arg(532.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn open_failure_is_a_connect_error() {
    let library = Arc::new(power_meter().fail_open(-1073807343));
    let registry = ResourceRegistry::new();
    let session = native_session(library.clone(), registry.clone());

    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Connect(TransportError::Native { code: -1073807343, .. })
    ));
    assert_eq!(session.state(), DeviceState::Disconnected);
    assert!(!registry.is_claimed(RESOURCE));
}

#[tokio::test]
async fn close_releases_the_handle_once() {
    let library = Arc::new(power_meter());
    let registry = ResourceRegistry::new();
    let session = native_session(library.clone(), registry.clone());
    session.connect().await.unwrap();

    session.close().await;
    session.close().await;
    assert_eq!(library.close_count(), 1);
    assert!(!registry.is_claimed(RESOURCE));

    let next = native_session(library.clone(), registry);
    next.connect().await.unwrap();
    assert_eq!(library.open_count(), 2);
}
