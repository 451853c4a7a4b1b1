//! Transports: the byte/call channel to one physical instrument.
//!
//! Every variant implements [`Transport`]. A transport is owned by exactly
//! one session and follows the same lifecycle:
//!
//! ```text
//! new --open()--> open --close()--> closed
//! ```
//!
//! Operations before `open()` fail with [`TransportError::NotOpen`], after
//! `close()` with [`TransportError::Closed`]. `close()` is idempotent and
//! releases the OS/driver resource once.
//!
//! # Variants
//!
//! - [`SerialTransport`] - RS-232/USB-serial via `serialport` (feature `instrument_serial`)
//! - [`VisaTransport`] - VISA resources via `visa-rs` (feature `instrument_visa`)
//! - [`NativeTransport`] - vendor libraries behind the [`NativeLibrary`] trait
//! - [`MockTransport`] - simulated devices for tests and dry runs

pub mod mock;
pub mod native;
pub mod resource;
pub mod serial;
pub mod visa;

pub use mock::{MockDevice, MockLibrary, MockProbe, MockResponse, MockTransport};
pub use native::{NativeHandle, NativeLibrary, NativeOutcome, NativeTransport};
pub use resource::{ResourceClaim, ResourceRegistry};
pub use serial::SerialTransport;
pub use visa::VisaTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::{Frame, RawReply, ReadUntil};
use crate::config::SessionConfig;
use crate::error::TransportError;

/// Which family of channel a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Serial port.
    Serial,
    /// VISA resource (GPIB, USB-TMC, TCPIP).
    Visa,
    /// Vendor library.
    Native,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Serial => "serial",
            TransportKind::Visa => "visa",
            TransportKind::Native => "native",
        })
    }
}

/// Channel contract shared by all transport variants.
#[async_trait]
pub trait Transport: Send {
    /// Family of this channel.
    fn kind(&self) -> TransportKind;

    /// Physical resource identifier (port path, VISA resource string, ...).
    fn resource(&self) -> &str;

    /// Whether `open` succeeded and `close` has not run.
    fn is_open(&self) -> bool;

    /// Acquire the OS or driver resource. Fails with `Closed` after `close`.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Send one frame in full.
    async fn write(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Read one reply, giving up after `timeout`.
    async fn read_until(
        &mut self,
        until: ReadUntil,
        timeout: Duration,
    ) -> Result<RawReply, TransportError>;

    /// Discard any unread input.
    async fn clear(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the resource. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Build the transport described by a session configuration.
///
/// Native transports need a loaded library and are built with
/// [`NativeTransport::new`] instead.
pub fn from_config(config: &SessionConfig) -> Result<Box<dyn Transport>, TransportError> {
    match config.transport {
        TransportKind::Serial => Ok(Box::new(SerialTransport::new(
            config.address.clone(),
            config.baud_rate.unwrap_or_default(),
            config.io_timeout(),
        ))),
        TransportKind::Visa => Ok(Box::new(VisaTransport::new(
            config.address.clone(),
            config.io_timeout(),
        ))),
        TransportKind::Native => Err(TransportError::Unsupported(
            "native (construct NativeTransport with a NativeLibrary)".into(),
        )),
    }
}

/// Lifecycle flag shared by the transport implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Link {
    #[default]
    Idle,
    Open,
    Closed,
}

impl Link {
    pub(crate) fn ensure_open(self) -> Result<(), TransportError> {
        match self {
            Link::Open => Ok(()),
            Link::Idle => Err(TransportError::NotOpen),
            Link::Closed => Err(TransportError::Closed),
        }
    }

    pub(crate) fn ensure_openable(self) -> Result<(), TransportError> {
        match self {
            Link::Closed => Err(TransportError::Closed),
            _ => Ok(()),
        }
    }
}

/// Accumulates bytes until a reply is complete under a [`ReadUntil`] rule.
///
/// Leading CR/LF bytes are skipped for line and block reads so that a
/// terminator left behind by a previous reply never reads as an empty line.
/// A block whose header cannot be sized is read up to the terminator and left
/// for the codec to reject.
#[derive(Debug)]
pub(crate) struct ReplyAssembler {
    until: ReadUntil,
    buf: Vec<u8>,
    unsized_block: bool,
}

impl ReplyAssembler {
    pub(crate) fn new(until: ReadUntil) -> Result<Self, TransportError> {
        if until == ReadUntil::Call {
            return Err(TransportError::Unsupported(
                "byte stream (call outputs requested)".into(),
            ));
        }
        Ok(Self {
            until,
            buf: Vec::new(),
            unsized_block: false,
        })
    }

    /// Feed one byte; returns true once the reply is complete.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        let skips_blank = !matches!(self.until, ReadUntil::Length(_));
        if self.buf.is_empty() && skips_blank && (byte == b'\r' || byte == b'\n') {
            return false;
        }
        self.buf.push(byte);

        match self.until {
            ReadUntil::Terminator(t) => byte == t,
            ReadUntil::Length(n) => self.buf.len() >= n,
            ReadUntil::Block { terminator } => {
                if self.unsized_block || self.buf[0] != b'#' || self.buf.get(1) == Some(&b'0') {
                    byte == terminator
                } else {
                    match crate::codec::block_len(&self.buf) {
                        Ok(Some(total)) => self.buf.len() >= total,
                        Ok(None) => false,
                        Err(_) => {
                            self.unsized_block = true;
                            byte == terminator
                        }
                    }
                }
            }
            ReadUntil::Call => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
