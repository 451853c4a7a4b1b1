//! VISA transport for GPIB/USB-TMC/LXI instruments.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1313::0x8078::P0005003::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! Requires the `instrument_visa` feature and a system VISA library. Without
//! the feature the transport still exists but `open()` reports it as
//! unsupported.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;

#[cfg(feature = "instrument_visa")]
use super::ReplyAssembler;
use super::{Link, Transport, TransportKind};
use crate::codec::{Frame, RawReply, ReadUntil};
use crate::error::TransportError;

/// Open VISA session plus the resource manager that owns it.
#[cfg(feature = "instrument_visa")]
struct VisaLink {
    // Dropping the resource manager closes every session it opened.
    _rm: visa_rs::DefaultRM,
    instrument: visa_rs::Instrument,
    /// Bytes read past the end of the previous reply.
    pending: Vec<u8>,
}

/// Instrument reached through the system VISA library.
pub struct VisaTransport {
    resource: String,
    io_timeout: Duration,
    link: Link,
    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaLink>>>,
}

impl VisaTransport {
    /// `io_timeout` bounds each write.
    pub fn new(resource: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            resource: resource.into(),
            io_timeout,
            link: Link::Idle,
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> Result<Arc<Mutex<VisaLink>>, TransportError> {
        self.link.ensure_open()?;
        self.session.clone().ok_or(TransportError::NotOpen)
    }
}

#[cfg(feature = "instrument_visa")]
fn join_error(err: tokio::task::JoinError) -> TransportError {
    TransportError::Io(format!("VISA I/O task failed: {err}"))
}

#[async_trait]
impl Transport for VisaTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Visa
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

        #[cfg(feature = "instrument_visa")]
        {
            use std::ffi::CString;
            use visa_rs::prelude::*;

            let resource = self.resource.clone();
            let link = tokio::task::spawn_blocking(move || {
                let open_error = |reason: String| TransportError::Open {
                    resource: resource.clone(),
                    reason,
                };
                let rm = DefaultRM::new().map_err(|e| open_error(e.to_string()))?;
                let expr = CString::new(resource.as_str())
                    .map_err(|e| open_error(e.to_string()))?
                    .into();
                let rsc = rm
                    .find_res(&expr)
                    .map_err(|_| TransportError::ResourceNotFound(resource.clone()))?;
                let instrument = rm
                    .open(&rsc, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(|e| open_error(e.to_string()))?;
                Ok::<_, TransportError>(VisaLink {
                    _rm: rm,
                    instrument,
                    pending: Vec::new(),
                })
            })
            .await
            .map_err(join_error)??;

            self.session = Some(Arc::new(Mutex::new(link)));
            self.link = Link::Open;
            debug!(resource = %self.resource, "VISA session opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(TransportError::Unsupported(
                "VISA (feature 'instrument_visa' disabled)".into(),
            ))
        }
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame
            .as_bytes()
            .ok_or_else(|| TransportError::Unsupported("native calls over VISA".into()))?
            .to_vec();

        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            let len = bytes.len();
            let task = tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let guard = session.blocking_lock();
                (&guard.instrument)
                    .write_all(&bytes)
                    .map_err(|e| TransportError::Write(e.to_string()))
            });
            tokio::time::timeout(self.io_timeout, task)
                .await
                .map_err(|_| TransportError::Timeout(self.io_timeout))?
                .map_err(join_error)??;
            debug!(resource = %self.resource, bytes = len, "VISA write");
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = bytes;
            self.link.ensure_open()?;
            Err(TransportError::NotOpen)
        }
    }

    async fn read_until(
        &mut self,
        until: ReadUntil,
        timeout: Duration,
    ) -> Result<RawReply, TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            let mut assembler = ReplyAssembler::new(until)?;

            let task = tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut guard = session.blocking_lock();
                let link = &mut *guard;
                let mut chunk = [0u8; 512];
                loop {
                    let mut consumed = 0;
                    let mut done = false;
                    for byte in &link.pending {
                        consumed += 1;
                        if assembler.push(*byte) {
                            done = true;
                            break;
                        }
                    }
                    link.pending.drain(..consumed);
                    if done {
                        return Ok(assembler.into_bytes());
                    }

                    let n = (&link.instrument).read(&mut chunk).map_err(|e| {
                        if e.kind() == std::io::ErrorKind::TimedOut {
                            TransportError::Timeout(timeout)
                        } else {
                            TransportError::Read(e.to_string())
                        }
                    })?;
                    if n == 0 {
                        return Err(TransportError::Read("unexpected end of VISA read".into()));
                    }
                    link.pending.extend_from_slice(&chunk[..n]);
                }
            });

            let bytes = tokio::time::timeout(timeout, task)
                .await
                .map_err(|_| TransportError::Timeout(timeout))?
                .map_err(join_error)??;
            debug!(resource = %self.resource, bytes = bytes.len(), "VISA read");
            Ok(RawReply::Bytes(bytes))
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = (until, timeout);
            self.link.ensure_open()?;
            Err(TransportError::NotOpen)
        }
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            session.lock().await.pending.clear();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.link == Link::Closed {
            return Ok(());
        }
        #[cfg(feature = "instrument_visa")]
        {
            self.session = None;
        }
        if self.link == Link::Open {
            debug!(resource = %self.resource, "VISA session closed");
        }
        self.link = Link::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_transport_creation() {
        let transport = VisaTransport::new("GPIB0::1::INSTR", Duration::from_secs(5));
        assert_eq!(transport.resource(), "GPIB0::1::INSTR");
        assert_eq!(transport.kind(), TransportKind::Visa);
        assert!(!transport.is_open());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_disabled_feature_reports_unsupported() {
        let mut transport = VisaTransport::new("GPIB0::1::INSTR", Duration::from_secs(5));
        assert!(matches!(
            transport.open().await,
            Err(TransportError::Unsupported(_))
        ));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_closed_transport_stays_closed() {
        let mut transport = VisaTransport::new("GPIB0::1::INSTR", Duration::from_secs(5));
        transport.close().await.unwrap();
        assert_eq!(transport.open().await, Err(TransportError::Closed));
    }
}
