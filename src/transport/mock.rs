//! Simulated instruments for tests and dry runs.
//!
//! [`MockTransport`] decodes every written frame back into a [`Command`]
//! with the session's own codec, asks a [`MockDevice`] what to do, and
//! encodes the answer the way the real instrument would. Replies are queued
//! with an arrival time so slow or silent devices exercise the same timeout
//! paths as hardware.
//!
//! [`MockLibrary`] plays the same role for [`NativeTransport`](super::NativeTransport).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::native::{NativeHandle, NativeLibrary, NativeOutcome};
use super::{Link, ReplyAssembler, Transport, TransportKind};
use crate::codec::{register_checksum, Frame, FrameCodec, Framing, NativeCall, RawReply, ReadUntil};
use crate::command::{Arg, Command, Reply, ReplyShape, Value};
use crate::error::TransportError;

/// What a simulated device does in response to one command.
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// Answer with this reply, encoded by the transport's codec.
    Reply(Reply),
    /// Put these exact bytes on the wire.
    Raw(Vec<u8>),
    /// Say nothing.
    Silent,
    /// Answer after a delay.
    Delayed(Duration, Box<MockResponse>),
    /// Fail the write itself.
    FailWrite(String),
}

impl MockResponse {
    /// Answer with a value.
    pub fn value(value: impl Into<Value>) -> Self {
        MockResponse::Reply(Reply::Value(value.into()))
    }

    /// Answer with the framing's acknowledgement.
    pub fn ack() -> Self {
        MockResponse::Reply(Reply::Ack)
    }

    /// Answer with a device error.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        MockResponse::Reply(Reply::Error {
            code,
            message: message.into(),
        })
    }

    /// Answer with `text` and a newline, bypassing the codec.
    pub fn line(text: &str) -> Self {
        MockResponse::Raw(format!("{text}\n").into_bytes())
    }

    /// Deliver this response `delay` after the write.
    pub fn after(self, delay: Duration) -> Self {
        MockResponse::Delayed(delay, Box::new(self))
    }
}

/// Behaviour of a simulated instrument.
pub trait MockDevice: Send {
    /// Response to one decoded command.
    fn respond(&mut self, command: &Command) -> MockResponse;
}

impl<F> MockDevice for F
where
    F: FnMut(&Command) -> MockResponse + Send,
{
    fn respond(&mut self, command: &Command) -> MockResponse {
        self(command)
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    commands: Vec<Command>,
    frames: Vec<Frame>,
    opens: usize,
    closes: usize,
    fail_open: Option<TransportError>,
}

/// Shared view of what a [`MockTransport`] saw, for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    /// Commands decoded from written frames, in write order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Names of the written commands, in write order.
    pub fn command_names(&self) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Every frame written, including ones that failed to decode.
    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.clone()
    }

    /// Frames written so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Successful opens.
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    /// Closes of an open link.
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Make the next `open()` fail with `error`.
    pub fn fail_next_open(&self, error: TransportError) {
        self.state.lock().fail_open = Some(error);
    }
}

#[derive(Debug)]
struct InFlight {
    ready_at: Instant,
    raw: RawReply,
}

/// In-memory transport that answers through a [`MockDevice`], with reply
/// latency and stray bytes handled like a real byte stream.
pub struct MockTransport {
    kind: TransportKind,
    resource: String,
    codec: FrameCodec,
    device: Box<dyn MockDevice>,
    link: Link,
    probe: MockProbe,
    open_delay: Duration,
    in_flight: VecDeque<InFlight>,
    /// Bytes that have arrived but were not read yet.
    rx: Vec<u8>,
    outputs: VecDeque<Vec<Value>>,
}

impl MockTransport {
    /// The transport kind follows the codec: call framing acts as a native
    /// library, SCPI as VISA, everything else as a serial port.
    pub fn new(resource: impl Into<String>, codec: FrameCodec, device: impl MockDevice + 'static) -> Self {
        let kind = match codec.framing() {
            Framing::Call => TransportKind::Native,
            Framing::Scpi => TransportKind::Visa,
            Framing::Line | Framing::Register => TransportKind::Serial,
        };
        Self {
            kind,
            resource: resource.into(),
            codec,
            device: Box::new(device),
            link: Link::Idle,
            probe: MockProbe::default(),
            open_delay: Duration::ZERO,
            in_flight: VecDeque::new(),
            rx: Vec::new(),
            outputs: VecDeque::new(),
        }
    }

    /// Report a different transport kind.
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes `open` take `delay`, like a port that is slow to enumerate.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Handle for inspecting traffic after the transport is boxed.
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    fn schedule(&mut self, command: &Command, response: MockResponse, delay: Duration) -> Result<(), TransportError> {
        let raw = match response {
            MockResponse::Silent => return Ok(()),
            MockResponse::FailWrite(reason) => return Err(TransportError::Write(reason)),
            MockResponse::Delayed(extra, inner) => return self.schedule(command, *inner, delay + extra),
            MockResponse::Raw(bytes) => RawReply::Bytes(bytes),
            MockResponse::Reply(reply) => match self.encode(command, &reply) {
                Some(raw) => raw,
                None => return Ok(()),
            },
        };
        self.in_flight.push_back(InFlight {
            ready_at: Instant::now() + delay,
            raw,
        });
        Ok(())
    }

    fn encode(&self, command: &Command, reply: &Reply) -> Option<RawReply> {
        let shape = match reply {
            Reply::Value(Value::Bytes(_)) => ReplyShape::Block,
            Reply::Value(Value::List(items)) => ReplyShape::Fields {
                separator: ",".into(),
                fields: vec![ReplyShape::Auto; items.len()],
            },
            _ => ReplyShape::Auto,
        };
        let raw = match self.codec.encode_reply(reply, &shape) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(command = %command, error = %e, "Mock device reply cannot be encoded");
                return None;
            }
        };
        Some(match (self.codec.framing(), raw) {
            (Framing::Register, RawReply::Bytes(mut bytes)) if bytes.len() == 4 => {
                // Replies echo the addressed register.
                if let Some(Arg::Int(register)) = command.arguments().first() {
                    bytes[1] = *register as u8;
                    bytes[0] &= 0x0f;
                    let checksum = register_checksum([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    bytes[0] |= checksum << 4;
                }
                RawReply::Bytes(bytes)
            }
            (_, raw) => raw,
        })
    }

    fn deliver_arrived(&mut self) {
        let now = Instant::now();
        while self.in_flight.front().is_some_and(|f| f.ready_at <= now) {
            if let Some(arrived) = self.in_flight.pop_front() {
                match arrived.raw {
                    RawReply::Bytes(bytes) => self.rx.extend_from_slice(&bytes),
                    RawReply::Native(outputs) => self.outputs.push_back(outputs),
                }
            }
        }
    }

    fn take_reply(&mut self, until: ReadUntil) -> Result<Option<RawReply>, TransportError> {
        if until == ReadUntil::Call {
            return Ok(self.outputs.pop_front().map(RawReply::Native));
        }
        let mut assembler = ReplyAssembler::new(until)?;
        for (i, byte) in self.rx.iter().enumerate() {
            if assembler.push(*byte) {
                self.rx.drain(..=i);
                return Ok(Some(RawReply::Bytes(assembler.into_bytes())));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        self.link == Link::Open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        self.link.ensure_openable()?;
        if self.link == Link::Open {
            return Ok(());
        }
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let mut state = self.probe.state.lock();
        if let Some(error) = state.fail_open.take() {
            return Err(error);
        }
        state.opens += 1;
        self.link = Link::Open;
        debug!(resource = %self.resource, "Mock transport opened");
        Ok(())
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.link.ensure_open()?;
        self.probe.state.lock().frames.push(frame.clone());

        let command = match self.codec.decode_command(frame, &[]) {
            Ok(command) => command,
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Mock device ignored an undecodable frame");
                return Ok(());
            }
        };
        self.probe.state.lock().commands.push(command.clone());

        let response = self.device.respond(&command);
        debug!(resource = %self.resource, command = %command, ?response, "Mock device");
        self.schedule(&command, response, Duration::ZERO)
    }

    async fn read_until(
        &mut self,
        until: ReadUntil,
        timeout: Duration,
    ) -> Result<RawReply, TransportError> {
        self.link.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            self.deliver_arrived();
            if let Some(raw) = self.take_reply(until)? {
                return Ok(raw);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            let wake = self
                .in_flight
                .front()
                .map(|f| f.ready_at.min(deadline))
                .unwrap_or(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        self.link.ensure_open()?;
        self.deliver_arrived();
        self.rx.clear();
        self.outputs.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.link == Link::Closed {
            return Ok(());
        }
        if self.link == Link::Open {
            self.probe.state.lock().closes += 1;
            debug!(resource = %self.resource, "Mock transport closed");
        }
        self.link = Link::Closed;
        self.in_flight.clear();
        self.rx.clear();
        Ok(())
    }
}

type CallHandler = Box<dyn FnMut(&NativeCall) -> NativeOutcome + Send>;

/// In-process stand-in for a vendor library.
pub struct MockLibrary {
    name: String,
    handler: Mutex<CallHandler>,
    messages: HashMap<i32, String>,
    fail_open: Option<i32>,
    next_handle: AtomicU64,
    opens: AtomicUsize,
    closes: AtomicUsize,
    calls: Mutex<Vec<NativeCall>>,
}

impl MockLibrary {
    /// A library named `name` whose calls go to `handler`.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&NativeCall) -> NativeOutcome + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Mutex::new(Box::new(handler)),
            messages: HashMap::new(),
            fail_open: None,
            next_handle: AtomicU64::new(1),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Text returned by the error-message lookup for `status`.
    pub fn with_message(mut self, status: i32, message: impl Into<String>) -> Self {
        self.messages.insert(status, message.into());
        self
    }

    /// Make every `open()` fail with `status`.
    pub fn fail_open(mut self, status: i32) -> Self {
        self.fail_open = Some(status);
        self
    }

    /// Handles opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Handles closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every call made, in order.
    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().clone()
    }
}

impl NativeLibrary for MockLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, _resource: &str) -> Result<NativeHandle, i32> {
        if let Some(status) = self.fail_open {
            return Err(status);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(NativeHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    fn call(&self, _handle: NativeHandle, call: &NativeCall) -> NativeOutcome {
        self.calls.lock().push(call.clone());
        let mut handler = self.handler.lock();
        (*handler)(call)
    }

    fn close(&self, _handle: NativeHandle) -> i32 {
        self.closes.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn error_message(&self, _handle: Option<NativeHandle>, status: i32) -> Option<String> {
        self.messages.get(&status).cloned()
    }
}
