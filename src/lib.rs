//! Core library for instrument control.
//!
//! One uniform command/response layer over heterogeneous laboratory
//! instruments: serial-line devices, VISA/SCPI instruments and vendor native
//! libraries. The layers, bottom up:
//!
//! - [`transport`]: byte (or call) channels with timeout-bounded I/O and
//!   exclusive resource claims.
//! - [`codec`]: logical commands to wire frames and raw replies back to
//!   typed values.
//! - [`session`]: connection lifecycle and device state for one instrument.
//! - [`dispatcher`]: serialized request/response with timeout and retry.
//! - [`profile`]: data-driven per-device command vocabularies.
//!
//! ```no_run
//! use rust_instrument::{Command, ReplyShape, Session, SessionConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let session = Session::new(SessionConfig::serial("/dev/ttyUSB0", 9600));
//! session.connect().await?;
//! session.execute(&Command::new("MOVE").arg(10.0).with_reply(ReplyShape::Ack)).await?;
//! let position = session.execute(&Command::query("POS?", ReplyShape::Float)).await?;
//! println!("{position:?}");
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod profile;
pub mod session;
pub mod transport;

pub use codec::{Frame, FrameCodec, Framing, FramingConfig, NativeCall, RawReply, ReadUntil};
pub use command::{Arg, ArgKind, Command, Reply, ReplyShape, Value};
pub use config::{ApplicationConfig, ConfigError, CoreConfig, SessionConfig, SessionDefinition};
pub use dispatcher::Dispatcher;
pub use error::{CodecError, CommandError, CommandResult, FailureKind, SessionError, TransportError};
pub use profile::{DeviceProfile, ProfileError, ProfileFormat, ProfileRegistry};
pub use session::{DeviceState, Identity, Session, SessionStatus};
pub use transport::{Transport, TransportKind};
