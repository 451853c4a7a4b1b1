//! Error types for the instrument-control core.
//!
//! The taxonomy mirrors the layers a command passes through, so callers can
//! tell a broken channel apart from a device that refused a command, and both
//! apart from caller misuse:
//!
//! - **`TransportError`**: open/write/read/close failures of the byte or call
//!   channel. Any of these (raised during `execute`) faults the session.
//! - **`CodecError`**: the reply could not be turned into a typed value, or the
//!   device answered with a recognised error token (`DeviceError`).
//! - **`SessionError`**: lifecycle misuse (`NotReady`, `SessionBusy`) and
//!   wrapped connect/identify failures.
//! - **`CommandError`**: what `Dispatcher::execute` returns. Device rejections
//!   are lifted into their own `Device` variant.
//!
//! Configuration and profile errors live next to their modules
//! (`config::ConfigError`, `profile::ProfileError`).

use std::time::Duration;

use thiserror::Error;

use crate::session::DeviceState;

/// Result of executing one command: a decoded reply or a typed failure.
pub type CommandResult = std::result::Result<crate::command::Reply, CommandError>;

/// Failures of the underlying channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The resource exists but could not be opened.
    #[error("Failed to open '{resource}': {reason}")]
    Open {
        /// Address that was being opened.
        resource: String,
        /// Driver or OS explanation.
        reason: String,
    },

    /// No device answers at this address.
    #[error("Resource '{0}' not found")]
    ResourceNotFound(String),

    /// Another session in this process holds the resource.
    #[error("Resource '{resource}' is already in use by session '{owner}'")]
    ResourceBusy {
        /// Contended address.
        resource: String,
        /// Id of the session holding it.
        owner: String,
    },

    /// Sending a frame failed.
    #[error("Write failed: {0}")]
    Write(String),

    /// Receiving a reply failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// No complete reply arrived within the timeout.
    #[error("Timed out after {0:?} waiting for reply")]
    Timeout(Duration),

    /// The transport was closed; it cannot be reopened.
    #[error("Transport is closed")]
    Closed,

    /// I/O attempted before `open`.
    #[error("Transport is not open")]
    NotOpen,

    /// A vendor library call returned a failure status.
    #[error("Native driver returned status {code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Native {
        /// Negative status returned by the library.
        code: i32,
        /// Library text for the status, when it has one.
        message: Option<String>,
    },

    /// The transport cannot perform this kind of I/O.
    #[error("Operation not supported by {0} transport")]
    Unsupported(String),

    /// Any other OS-level failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransportError::ResourceNotFound(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Failures turning wire data into typed values (or back).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The bytes do not match the expected reply shape.
    #[error("Malformed reply: {0}")]
    Malformed(String),

    /// The reply was a recognised device error token.
    #[error("Device reported error {code}: {message}")]
    DeviceError {
        /// Device error number, or -1 when none was given.
        code: i32,
        /// Device error text.
        message: String,
    },

    /// An argument cannot be put on the wire in this framing.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The framing has no encoding for this request or reply.
    #[error("Unsupported by this framing: {0}")]
    Unsupported(String),
}

/// Session lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The operation is not allowed in the current state.
    #[error("Session is not ready (state: {0})")]
    NotReady(DeviceState),

    /// Another operation holds the channel.
    #[error("Session is busy with another command")]
    SessionBusy,

    /// Claiming or opening the transport failed.
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),

    /// The identification query failed or its reply was unusable.
    #[error("Identify failed: {0}")]
    Identify(String),
}

/// Coarse classification used to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The channel is broken; the session is faulted.
    Channel,
    /// The device understood the request and refused it.
    Device,
    /// The caller used the session wrongly (busy, not ready).
    Misuse,
    /// The reply or request could not be encoded/decoded.
    Protocol,
}

/// Failure returned by `Dispatcher::execute`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The session refused to run the command.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The channel failed; the session is faulted.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device answered with an error.
    #[error("Device rejected command (code {code}): {message}")]
    Device {
        /// Device error number.
        code: i32,
        /// Device error text.
        message: String,
    },

    /// The reply could not be decoded.
    #[error("Codec error: {0}")]
    Codec(CodecError),
}

impl From<CodecError> for CommandError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::DeviceError { code, message } => CommandError::Device { code, message },
            other => CommandError::Codec(other),
        }
    }
}

impl CommandError {
    /// Classify this failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CommandError::Session(SessionError::Connect(_)) => FailureKind::Channel,
            CommandError::Session(_) => FailureKind::Misuse,
            CommandError::Transport(_) => FailureKind::Channel,
            CommandError::Device { .. } => FailureKind::Device,
            CommandError::Codec(_) => FailureKind::Protocol,
        }
    }

    /// True when the device, not the channel, refused the command.
    pub fn is_device_error(&self) -> bool {
        matches!(self, CommandError::Device { .. })
    }

    /// True when the failure was a reply timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Transport(TransportError::Timeout(_)))
    }
}
