//! RS-232 / USB-serial transport.
//!
//! Wraps the `serialport` crate. Port I/O is synchronous, so every operation
//! runs on Tokio's blocking pool while the async caller waits on the join
//! handle. Reads poll the port with a short internal timeout and check an
//! overall deadline between polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

#[cfg(feature = "instrument_serial")]
use super::ReplyAssembler;
use super::{Link, Transport, TransportKind};
use crate::codec::{Frame, RawReply, ReadUntil};
use crate::error::TransportError;

/// Used when the config gives no baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Internal poll interval of the OS read call.
#[cfg(feature = "instrument_serial")]
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Serial port with `serialport` defaults (8N1, no flow control).
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    path: String,
    baud_rate: u32,
    /// Bound on a single write.
    write_timeout: Duration,
    link: Link,
    /// Set by `close()` so an in-flight blocking read stops early.
    closing: Arc<AtomicBool>,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// A zero `baud_rate` selects [`DEFAULT_BAUD_RATE`].
    pub fn new(path: impl Into<String>, baud_rate: u32, write_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate: if baud_rate == 0 { DEFAULT_BAUD_RATE } else { baud_rate },
            write_timeout,
            link: Link::Idle,
            closing: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Line speed used on open.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>, TransportError> {
        self.link.ensure_open()?;
        self.port.clone().ok_or(TransportError::NotOpen)
    }
}

#[cfg(feature = "instrument_serial")]
fn open_error(path: &str, err: serialport::Error) -> TransportError {
    use serialport::ErrorKind;
    match err.kind() {
        ErrorKind::NoDevice | ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::ResourceNotFound(path.to_string())
        }
        _ => TransportError::Open {
            resource: path.to_string(),
            reason: err.to_string(),
        },
    }
}

fn join_error(err: tokio::task::JoinError) -> TransportError {
    TransportError::Io(format!("serial I/O task failed: {err}"))
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn resource(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.link == Link::Open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        self.link.ensure_openable()?;
        if self.link == Link::Open {
            return Ok(());
        }

        #[cfg(feature = "instrument_serial")]
        {
            let path = self.path.clone();
            let baud_rate = self.baud_rate;
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&path, baud_rate)
                    .timeout(POLL_INTERVAL)
                    .open()
                    .map_err(|e| open_error(&path, e))
            })
            .await
            .map_err(join_error)??;

            self.port = Some(Arc::new(Mutex::new(port)));
            self.link = Link::Open;
            debug!(path = %self.path, baud_rate = self.baud_rate, "Serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(TransportError::Unsupported(
                "serial (feature 'instrument_serial' disabled)".into(),
            ))
        }
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame
            .as_bytes()
            .ok_or_else(|| TransportError::Unsupported("native calls over serial".into()))?
            .to_vec();

        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let len = bytes.len();
            let task = tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port = port.blocking_lock();
                port.write_all(&bytes)
                    .and_then(|_| port.flush())
                    .map_err(|e| TransportError::Write(e.to_string()))
            });
            tokio::time::timeout(self.write_timeout, task)
                .await
                .map_err(|_| TransportError::Timeout(self.write_timeout))?
                .map_err(join_error)??;
            debug!(path = %self.path, bytes = len, "Serial write");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            self.link.ensure_open()?;
            let _ = bytes;
            Err(TransportError::NotOpen)
        }
    }

    async fn read_until(
        &mut self,
        until: ReadUntil,
        timeout: Duration,
    ) -> Result<RawReply, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let mut assembler = ReplyAssembler::new(until)?;
            let closing = self.closing.clone();

            let bytes = tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut port = port.blocking_lock();
                let deadline = std::time::Instant::now() + timeout;
                let mut byte = [0u8; 1];
                loop {
                    if closing.load(Ordering::Acquire) {
                        return Err(TransportError::Closed);
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(TransportError::Timeout(timeout));
                    }
                    match port.read(&mut byte) {
                        Ok(1) => {
                            if assembler.push(byte[0]) {
                                return Ok(assembler.into_bytes());
                            }
                        }
                        Ok(_) => return Err(TransportError::Read("unexpected EOF".into())),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(TransportError::Read(e.to_string())),
                    }
                }
            })
            .await
            .map_err(join_error)??;

            debug!(path = %self.path, bytes = bytes.len(), "Serial read");
            Ok(RawReply::Bytes(bytes))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (until, timeout);
            self.link.ensure_open()?;
            Err(TransportError::NotOpen)
        }
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            tokio::task::spawn_blocking(move || {
                port.blocking_lock()
                    .clear(serialport::ClearBuffer::All)
                    .map_err(|e| TransportError::Io(e.to_string()))
            })
            .await
            .map_err(join_error)??;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.link == Link::Closed {
            return Ok(());
        }
        self.closing.store(true, Ordering::Release);
        #[cfg(feature = "instrument_serial")]
        {
            // A blocking read still holding a clone drops it at its next poll.
            self.port = None;
        }
        if self.link == Link::Open {
            debug!(path = %self.path, "Serial port closed");
        }
        self.link = Link::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_creation() {
        let transport = SerialTransport::new("/dev/ttyUSB0", 0, Duration::from_secs(1));
        assert_eq!(transport.resource(), "/dev/ttyUSB0");
        assert_eq!(transport.baud_rate(), DEFAULT_BAUD_RATE);
        assert_eq!(transport.kind(), TransportKind::Serial);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_io_before_open_is_rejected() {
        let mut transport = SerialTransport::new("COM3", 115200, Duration::from_secs(1));
        let err = transport
            .read_until(ReadUntil::Terminator(b'\n'), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotOpen);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let mut transport = SerialTransport::new("COM3", 115200, Duration::from_secs(1));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.open().await, Err(TransportError::Closed));
        let err = transport
            .write(&Frame::Bytes(b"X\n".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test]
    async fn test_missing_port_is_not_found() {
        let mut transport =
            SerialTransport::new("/dev/rust-instrument-missing", 9600, Duration::from_secs(1));
        let err = transport.open().await.unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::ResourceNotFound(_) | TransportError::Open { .. }
            ),
            "unexpected error: {err:?}"
        );
    }
}
