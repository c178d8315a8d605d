//! Character stream the engine talks over
//!
//! The engine does not drive any hardware itself. A transport is a duplex byte link with
//! non-blocking read and write, a readiness poll and a "data became ready" notification the
//! engine uses to schedule out-of-band processing.
use std::sync::Arc;
use std::time::Duration;

/// Called by the transport whenever new input arrives
pub type DataReadyCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The link was closed by the other side
    Closed,
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> TransportError {
        TransportError::Io(e.kind())
    }
}

pub trait Transport: Send {
    /// Reads whatever is available, `WouldBlock` when nothing is
    fn read(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError>;

    /// Writes as much as the link accepts right now, `WouldBlock` when nothing fits
    fn write(&mut self, buf: &[u8]) -> nb::Result<usize, TransportError>;

    /// Waits at most `timeout` for input to become available
    fn poll_readable(&mut self, timeout: Duration) -> bool;

    /// Waits at most `timeout` for the link to accept output
    fn poll_writable(&mut self, timeout: Duration) -> bool;

    /// Registers (or with `None` removes) the data-ready notification
    fn set_data_ready_callback(&mut self, callback: Option<DataReadyCallback>);
}
