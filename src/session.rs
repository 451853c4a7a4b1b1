//! Sessions: one transport, one device, one state machine.
//!
//! ```text
//!                 connect()            identify()
//! Disconnected ─────────────> Connected ─────────────> Identified
//!      ^                         │  ^                    │  ^
//!      │ close()       execute() v  │ ok / device error  v  │
//!      └──────────────────────── Busy ───────────────────┘  │
//!                                 │ transport failure       │
//!                                 v                         │
//!                              Faulted ──── reset() ────────┘ (-> Connected)
//! ```
//!
//! A session owns its transport exclusively and holds a process-wide claim
//! on the transport's resource while connected. All I/O goes through a
//! single async mutex, so at most one command is in flight per session.
//! `close()` is terminal: it aborts any pending read and releases the claim.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::codec::{FrameCodec, Framing};
use crate::command::{Command, Reply, ReplyShape, Value};
use crate::config::SessionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{CommandResult, SessionError, TransportError};
use crate::transport::{self, ResourceClaim, ResourceRegistry, Transport};

/// Lifecycle state of the device behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// No open transport. Initial state, and terminal after `close`.
    Disconnected,
    /// Transport open, device not yet identified.
    Connected,
    /// Transport open and identity known.
    Identified,
    /// A command is in flight.
    Busy,
    /// The channel failed; only `reset` or `close` are accepted.
    Faulted,
}

impl DeviceState {
    /// Whether a command may be started in this state.
    pub fn is_ready(self) -> bool {
        matches!(self, DeviceState::Connected | DeviceState::Identified)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connected => "connected",
            DeviceState::Identified => "identified",
            DeviceState::Busy => "busy",
            DeviceState::Faulted => "faulted",
        })
    }
}

/// Who the device says it is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Vendor name.
    pub manufacturer: String,
    /// Model designation.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Firmware version, plus any extra identification fields.
    pub firmware: String,
}

impl Identity {
    /// Parse a `*IDN?`-style reply (`manufacturer,model,serial,firmware`).
    ///
    /// Missing trailing fields are left empty. Extra fields are folded into
    /// the firmware string.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let mut fields = text.splitn(4, ',').map(|f| f.trim().to_string());
        Some(Self {
            manufacturer: fields.next().unwrap_or_default(),
            model: fields.next().unwrap_or_default(),
            serial: fields.next().unwrap_or_default(),
            firmware: fields.next().unwrap_or_default(),
        })
    }

    /// Build an identity from a decoded reply value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(text) => Self::parse(text),
            Value::List(items) => {
                let joined = items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                Self::parse(&joined)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (s/n {}, fw {})",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

/// Point-in-time view of a session, for logs and status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Id used in log fields.
    pub session_id: String,
    /// Transport address.
    pub resource: String,
    /// Current lifecycle state.
    pub state: DeviceState,
    /// Id of the most recently started command.
    pub last_command_id: Option<u64>,
    /// Identity from the last successful `identify`.
    pub identity: Option<Identity>,
    /// How many times the session has faulted.
    pub fault_count: u64,
}

#[derive(Debug)]
struct StateCell {
    state: DeviceState,
    identity: Option<Identity>,
    last_command_id: Option<u64>,
    fault_count: u64,
    closed: bool,
}

/// Everything that may only be touched by the command in flight.
pub(crate) struct Channel {
    transport: Option<Box<dyn Transport>>,
    claim: Option<ResourceClaim>,
    /// The transport is built from the session config and may be rebuilt.
    rebuildable: bool,
}

impl Channel {
    pub(crate) fn transport(&mut self) -> Result<&mut (dyn Transport + 'static), TransportError> {
        match self.transport.as_mut() {
            Some(transport) if transport.is_open() => Ok(&mut **transport),
            Some(_) | None => Err(TransportError::NotOpen),
        }
    }
}

/// Exclusive handle to the channel, held for the duration of one operation.
pub(crate) type ChannelGuard<'a> = MutexGuard<'a, Channel>;

/// A connection to one instrument.
pub struct Session {
    id: String,
    config: SessionConfig,
    codec: FrameCodec,
    dispatcher: Dispatcher,
    identify_command: Option<Command>,
    registry: ResourceRegistry,
    state: Mutex<StateCell>,
    channel: AsyncMutex<Channel>,
    shutdown: watch::Sender<bool>,
    command_ids: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish()
    }
}

fn default_identify(framing: Framing) -> Option<Command> {
    match framing {
        Framing::Line | Framing::Scpi => Some(Command::query("*IDN?", ReplyShape::Text)),
        Framing::Call => Some(Command::query(
            "identificationQuery",
            ReplyShape::Fields {
                separator: ",".into(),
                fields: vec![ReplyShape::Text; 4],
            },
        )),
        Framing::Register => None,
    }
}

impl Session {
    /// Session whose transport is built from `config` on `connect()`.
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    /// Session over an already constructed transport.
    pub fn with_transport(config: SessionConfig, transport: Box<dyn Transport>) -> Self {
        Self::build(config, Some(transport))
    }

    fn build(config: SessionConfig, transport: Option<Box<dyn Transport>>) -> Self {
        let codec = FrameCodec::for_kind(config.transport);
        let (shutdown, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dispatcher: Dispatcher::from_config(&config),
            identify_command: default_identify(codec.framing()),
            codec,
            config,
            registry: ResourceRegistry::global(),
            state: Mutex::new(StateCell {
                state: DeviceState::Disconnected,
                identity: None,
                last_command_id: None,
                fault_count: 0,
                closed: false,
            }),
            channel: AsyncMutex::new(Channel {
                rebuildable: transport.is_none(),
                transport,
                claim: None,
            }),
            shutdown,
            command_ids: AtomicU64::new(1),
        }
    }

    /// Replace the generated session id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the codec. The identification command follows the new
    /// framing unless one was set explicitly afterwards.
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.identify_command = default_identify(codec.framing());
        self.codec = codec;
        self
    }

    /// Replace the dispatcher built from the config.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Query sent by `identify` instead of the framing default.
    pub fn with_identify_command(mut self, command: Command) -> Self {
        self.identify_command = Some(command);
        self
    }

    /// Use a private resource registry instead of the process-wide one.
    pub fn with_registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Session id, unique within the process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Config the session was built from.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Codec used for every command on this session.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Dispatcher used by `execute`.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Reply timeout for commands without their own.
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.state.lock().state
    }

    /// Identity from the last successful `identify`.
    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    /// Id of the most recently started command.
    pub fn last_command_id(&self) -> Option<u64> {
        self.state.lock().last_command_id
    }

    /// Snapshot of state, identity and counters.
    pub fn status(&self) -> SessionStatus {
        let cell = self.state.lock();
        SessionStatus {
            session_id: self.id.clone(),
            resource: self.config.address.clone(),
            state: cell.state,
            last_command_id: cell.last_command_id,
            identity: cell.identity.clone(),
            fault_count: cell.fault_count,
        }
    }

    /// Claim the resource and open the transport.
    ///
    /// Connecting an already connected session is a no-op. A faulted session
    /// must be `reset()` first; a closed session cannot be reopened.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut channel = self.channel.try_lock().map_err(|_| SessionError::SessionBusy)?;
        {
            let cell = self.state.lock();
            if cell.closed {
                return Err(SessionError::NotReady(DeviceState::Disconnected));
            }
            match cell.state {
                DeviceState::Disconnected => {}
                DeviceState::Connected | DeviceState::Identified => return Ok(()),
                other => return Err(SessionError::NotReady(other)),
            }
        }

        let claim = self
            .registry
            .claim(&self.config.address, &self.id)
            .map_err(SessionError::Connect)?;

        if channel.transport.is_none() {
            channel.transport = Some(transport::from_config(&self.config).map_err(SessionError::Connect)?);
        }
        let transport = channel
            .transport
            .as_mut()
            .ok_or(SessionError::Connect(TransportError::NotOpen))?;

        // On failure the claim is dropped here, releasing the resource.
        transport.open().await.map_err(|e| {
            warn!(session = %self.id, address = %self.config.address, error = %e, "Connect failed");
            SessionError::Connect(e)
        })?;

        let closed = {
            let mut cell = self.state.lock();
            if !cell.closed {
                cell.state = DeviceState::Connected;
            }
            cell.closed
        };
        if closed {
            // close() ran while opening and is waiting on the channel; the
            // claim is released on return.
            if let Err(e) = transport.close().await {
                warn!(session = %self.id, error = %e, "Transport close failed");
            }
            return Err(SessionError::NotReady(DeviceState::Disconnected));
        }
        channel.claim = Some(claim);
        info!(
            session = %self.id,
            address = %self.config.address,
            transport = %self.config.transport,
            "Session connected"
        );
        Ok(())
    }

    /// Query the device identity.
    ///
    /// Failures leave the state unchanged and never fault the session.
    pub async fn identify(&self) -> Result<Identity, SessionError> {
        let command = self.identify_command.clone().ok_or_else(|| {
            SessionError::Identify(format!(
                "no identification command for {:?} framing",
                self.codec.framing()
            ))
        })?;

        let mut channel = self.acquire_channel(self.dispatcher.busy_wait()).await?;
        let prior = self.begin()?;

        let outcome = async {
            let transport = channel.transport().map_err(|e| e.to_string())?;
            let reply = self
                .dispatcher
                .exchange(self, transport, &command, 1)
                .await
                .map_err(|e| e.to_string())?;
            match reply {
                Reply::Value(value) => Identity::from_value(&value)
                    .ok_or_else(|| format!("unrecognised identification reply '{value}'")),
                other => Err(format!("identification returned {other:?}")),
            }
        }
        .await;

        let mut cell = self.state.lock();
        match outcome {
            Ok(identity) => {
                if !cell.closed {
                    cell.state = DeviceState::Identified;
                }
                cell.identity = Some(identity.clone());
                drop(cell);
                info!(session = %self.id, %identity, "Device identified");
                Ok(identity)
            }
            Err(reason) => {
                if !cell.closed {
                    cell.state = prior;
                }
                drop(cell);
                warn!(session = %self.id, %reason, "Identify failed");
                Err(SessionError::Identify(reason))
            }
        }
    }

    /// Execute one command with this session's dispatcher.
    pub async fn execute(&self, command: &Command) -> CommandResult {
        self.dispatcher.execute(self, command).await
    }

    /// Bring the session back to a usable state.
    ///
    /// With the transport still open, unread input is discarded and the
    /// session returns to `Connected` (clearing a fault). If the transport is
    /// not open, or cannot be flushed, the session ends `Disconnected` and the
    /// claim is released so `connect()` can be called again.
    pub async fn reset(&self) -> Result<DeviceState, SessionError> {
        let mut channel = self.channel.try_lock().map_err(|_| SessionError::SessionBusy)?;
        if self.state.lock().closed {
            return Ok(DeviceState::Disconnected);
        }

        let cleared = match channel.transport() {
            Ok(transport) => match transport.clear().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(session = %self.id, error = %e, "Reset could not flush the transport");
                    let _ = transport.close().await;
                    false
                }
            },
            Err(_) => false,
        };

        let next = if cleared {
            DeviceState::Connected
        } else {
            channel.claim = None;
            if channel.rebuildable && channel.transport.as_ref().is_some_and(|t| !t.is_open()) {
                // Closed transports cannot be reopened; connect() builds a new one.
                channel.transport = None;
            }
            DeviceState::Disconnected
        };

        let mut cell = self.state.lock();
        cell.state = next;
        cell.identity = None;
        drop(cell);
        info!(session = %self.id, state = %next, "Session reset");
        Ok(next)
    }

    /// Tear the session down. Terminal and idempotent.
    ///
    /// A command waiting on a reply fails with [`TransportError::Closed`].
    pub async fn close(&self) {
        {
            let mut cell = self.state.lock();
            if cell.closed {
                return;
            }
            cell.closed = true;
            cell.state = DeviceState::Disconnected;
        }
        self.shutdown.send_replace(true);

        let mut channel = self.channel.lock().await;
        if let Some(transport) = channel.transport.as_mut() {
            if let Err(e) = transport.close().await {
                warn!(session = %self.id, error = %e, "Transport close failed");
            }
        }
        channel.claim = None;
        info!(session = %self.id, address = %self.config.address, "Session closed");
    }

    pub(crate) async fn acquire_channel(
        &self,
        busy_wait: Option<Duration>,
    ) -> Result<ChannelGuard<'_>, SessionError> {
        if let Ok(guard) = self.channel.try_lock() {
            return Ok(guard);
        }
        match busy_wait {
            None => Err(SessionError::SessionBusy),
            Some(wait) => tokio::time::timeout(wait, self.channel.lock())
                .await
                .map_err(|_| SessionError::SessionBusy),
        }
    }

    /// Move a ready session to `Busy`, returning the state to restore.
    pub(crate) fn begin(&self) -> Result<DeviceState, SessionError> {
        let mut cell = self.state.lock();
        if cell.closed {
            return Err(SessionError::NotReady(DeviceState::Disconnected));
        }
        let prior = cell.state;
        if !prior.is_ready() {
            return Err(SessionError::NotReady(prior));
        }
        cell.state = DeviceState::Busy;
        Ok(prior)
    }

    /// Leave `Busy` after a command that did not break the channel.
    pub(crate) fn finish(&self, prior: DeviceState, command_id: Option<u64>) {
        let mut cell = self.state.lock();
        if !cell.closed {
            cell.state = prior;
        }
        if command_id.is_some() {
            cell.last_command_id = command_id;
        }
    }

    pub(crate) fn fault(&self, error: &TransportError) {
        let mut cell = self.state.lock();
        if cell.closed {
            return;
        }
        cell.state = DeviceState::Faulted;
        cell.fault_count += 1;
        drop(cell);
        warn!(session = %self.id, address = %self.config.address, %error, "Session faulted");
    }

    pub(crate) fn next_command_id(&self) -> u64 {
        self.command_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a transport operation, aborting it if the session is closed.
    pub(crate) async fn guarded<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            result = op => result,
            _ = shutdown.changed() => {
                debug!(session = %self.id, "Pending transport operation aborted by close");
                Err(TransportError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse() {
        let id = Identity::parse("THORLABS,PM100USB,P2000123,1.6.0\n").unwrap();
        assert_eq!(id.manufacturer, "THORLABS");
        assert_eq!(id.model, "PM100USB");
        assert_eq!(id.serial, "P2000123");
        assert_eq!(id.firmware, "1.6.0");

        let short = Identity::parse("Grbl 1.1h").unwrap();
        assert_eq!(short.manufacturer, "Grbl 1.1h");
        assert!(short.firmware.is_empty());

        assert!(Identity::parse("  ").is_none());
    }

    #[test]
    fn test_identity_from_fields() {
        let value = Value::List(vec![
            Value::Text("Thorlabs".into()),
            Value::Text("CLD1015".into()),
            Value::Text("M00412345".into()),
            Value::Text("2.1".into()),
        ]);
        let id = Identity::from_value(&value).unwrap();
        assert_eq!(id.model, "CLD1015");
        assert!(Identity::from_value(&Value::Int(3)).is_none());
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let session = Session::new(SessionConfig::serial("/dev/ttyUSB9", 9600)).with_id("stage");
        assert_eq!(session.state(), DeviceState::Disconnected);
        let status = session.status();
        assert_eq!(status.session_id, "stage");
        assert_eq!(status.resource, "/dev/ttyUSB9");
        assert_eq!(status.last_command_id, None);
        assert_eq!(status.fault_count, 0);
    }

    #[test]
    fn test_default_identify_follows_framing() {
        assert_eq!(
            default_identify(Framing::Scpi).map(|c| c.name().to_string()),
            Some("*IDN?".into())
        );
        assert_eq!(
            default_identify(Framing::Call).map(|c| c.name().to_string()),
            Some("identificationQuery".into())
        );
        assert!(default_identify(Framing::Register).is_none());
    }

    #[test]
    fn test_status_serializes() {
        let session = Session::new(SessionConfig::visa("GPIB0::3::INSTR")).with_id("dmm");
        let json = serde_json::to_value(session.status()).unwrap();
        assert_eq!(json["state"], "disconnected");
        assert_eq!(json["session_id"], "dmm");
    }
}
