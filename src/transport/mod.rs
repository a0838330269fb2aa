//! Byte transport under the OI driver.
//!
//! The driver and its stream reader are written against this seam instead
//! of a concrete serial port, so the whole command/stream/recovery stack
//! runs unmodified against the bench simulator.
//!
//! Contract the OI layer depends on:
//!
//! - `read` must report an idle line as `Ok(0)`, never as an error: the
//!   stream reader's stall accounting (5 silent periods → link restart)
//!   only works if timeouts and "no bytes yet" look identical.
//! - `read` may return any prefix of the available bytes; the frame
//!   reassembler buffers across reads.
//! - `write` + `flush` must push a whole command frame (OI commands are at
//!   most a handful of bytes); a failed write means the link is gone and
//!   the caller drops the transport for reopening.

use crate::error::Result;

mod serial;
pub use serial::SerialTransport;

mod mock;
pub use mock::BenchLink;

/// One end of the robot link.
pub trait Transport: Send {
    /// Read available bytes into `buffer`; `Ok(0)` when the line is idle.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write command bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Push anything buffered out to the robot.
    fn flush(&mut self) -> Result<()>;
}

/// Opens a fresh transport after a link reset.
///
/// The stream supervisor closes and reopens the port during self-healing, so
/// the driver keeps a factory rather than a single transport instance.
pub trait TransportFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn Transport>>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Result<Box<dyn Transport>> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn Transport>> {
        self()
    }
}
