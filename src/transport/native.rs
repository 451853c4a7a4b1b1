//! Native-library transport.
//!
//! Vendor libraries (power-meter and laser DLLs, VISA-style C APIs) are
//! reached through the [`NativeLibrary`] trait. Each call returns an integer
//! status: zero is success, negative values are failures and positive values
//! are warnings. A failing status becomes [`TransportError::Native`] with the
//! library's own message for that code.
//!
//! Calls are synchronous, so they run on the blocking pool. `write()` performs
//! the call and keeps its outputs; the following `read_until(ReadUntil::Call)`
//! hands them back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Link, Transport, TransportKind};
use crate::codec::{Frame, NativeCall, RawReply, ReadUntil};
use crate::command::Value;
use crate::error::TransportError;

/// Instrument handle issued by a native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Status and outputs of one native call.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeOutcome {
    /// Zero or positive on success, negative on failure.
    pub status: i32,
    /// Output parameters in declaration order.
    pub outputs: Vec<Value>,
}

impl NativeOutcome {
    /// Success with `outputs`.
    pub fn ok(outputs: Vec<Value>) -> Self {
        Self { status: 0, outputs }
    }

    /// A bare status with no outputs.
    pub fn status(status: i32) -> Self {
        Self {
            status,
            outputs: Vec::new(),
        }
    }
}

/// A loaded vendor library.
pub trait NativeLibrary: Send + Sync {
    /// Library name for logs (e.g. "TLPM").
    fn name(&self) -> &str;

    /// Open an instrument; `Err` carries the failing status.
    fn open(&self, resource: &str) -> Result<NativeHandle, i32>;

    /// Invoke one function on an open instrument.
    fn call(&self, handle: NativeHandle, call: &NativeCall) -> NativeOutcome;

    /// Close an instrument, returning its status.
    fn close(&self, handle: NativeHandle) -> i32;

    /// Human-readable text for a status code.
    fn error_message(&self, _handle: Option<NativeHandle>, _status: i32) -> Option<String> {
        None
    }
}

/// Transport that turns call frames into library calls.
pub struct NativeTransport {
    library: Arc<dyn NativeLibrary>,
    resource: String,
    /// Bound on a single library call.
    call_timeout: Duration,
    link: Link,
    handle: Option<NativeHandle>,
    outputs: Option<Vec<Value>>,
}

impl NativeTransport {
    /// Each library call is bounded by `call_timeout`.
    pub fn new(
        library: Arc<dyn NativeLibrary>,
        resource: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            library,
            resource: resource.into(),
            call_timeout,
            link: Link::Idle,
            handle: None,
            outputs: None,
        }
    }

    /// Handle of the open instrument.
    pub fn handle(&self) -> Option<NativeHandle> {
        self.handle
    }

    fn status_error(&self, status: i32) -> TransportError {
        TransportError::Native {
            code: status,
            message: self.library.error_message(self.handle, status),
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> TransportError {
    TransportError::Io(format!("native call task failed: {err}"))
}

#[async_trait]
impl Transport for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
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
        let library = self.library.clone();
        let resource = self.resource.clone();
        let opened = tokio::task::spawn_blocking(move || library.open(&resource))
            .await
            .map_err(join_error)?;

        match opened {
            Ok(handle) => {
                self.handle = Some(handle);
                self.link = Link::Open;
                debug!(
                    library = self.library.name(),
                    resource = %self.resource,
                    ?handle,
                    "Native instrument opened"
                );
                Ok(())
            }
            Err(status) => Err(self.status_error(status)),
        }
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.link.ensure_open()?;
        let Frame::Call(call) = frame else {
            return Err(TransportError::Unsupported(
                "byte frames on a native library".into(),
            ));
        };
        let handle = self.handle.ok_or(TransportError::NotOpen)?;
        self.outputs = None;

        let library = self.library.clone();
        let call = call.clone();
        let function = call.function.clone();
        let task = tokio::task::spawn_blocking(move || library.call(handle, &call));
        let outcome = tokio::time::timeout(self.call_timeout, task)
            .await
            .map_err(|_| TransportError::Timeout(self.call_timeout))?
            .map_err(join_error)?;

        if outcome.status < 0 {
            return Err(self.status_error(outcome.status));
        }
        if outcome.status > 0 {
            warn!(
                library = self.library.name(),
                %function,
                status = outcome.status,
                message = ?self.library.error_message(self.handle, outcome.status),
                "Native call returned a warning"
            );
        }
        debug!(library = self.library.name(), %function, outputs = outcome.outputs.len(), "Native call");
        self.outputs = Some(outcome.outputs);
        Ok(())
    }

    async fn read_until(
        &mut self,
        until: ReadUntil,
        _timeout: Duration,
    ) -> Result<RawReply, TransportError> {
        self.link.ensure_open()?;
        if until != ReadUntil::Call {
            return Err(TransportError::Unsupported(
                "byte reads on a native library".into(),
            ));
        }
        self.outputs
            .take()
            .map(RawReply::Native)
            .ok_or_else(|| TransportError::Read("no call outputs pending".into()))
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        self.outputs = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.link == Link::Closed {
            return Ok(());
        }
        self.link = Link::Closed;
        self.outputs = None;
        if let Some(handle) = self.handle.take() {
            let library = self.library.clone();
            let status = tokio::task::spawn_blocking(move || library.close(handle))
                .await
                .map_err(join_error)?;
            if status < 0 {
                warn!(
                    library = self.library.name(),
                    status,
                    message = ?self.library.error_message(None, status),
                    "Native close reported an error"
                );
            }
            debug!(library = self.library.name(), resource = %self.resource, "Native instrument closed");
        }
        Ok(())
    }
}
