//! Serial transport implementation

use super::Transport;
use crate::error::{Error, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Serial transport for the robot's Open Interface port
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Baud rate (OI default 115200)
    /// * `timeout` - Read timeout; reads past it report 0 bytes
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| Error::PortUnavailable(format!("{}: {}", path, e)))?;

        log::info!("Opened serial port: {} at {} baud", path, baud_rate);

        let mut transport = SerialTransport { port };
        transport.assert_control_lines();
        Ok(transport)
    }

    /// Assert DTR/RTS so USB-serial adapters wake the OI port. Adapters that
    /// do not expose the lines are left at their platform default.
    fn assert_control_lines(&mut self) {
        if let Err(e) = self.port.write_data_terminal_ready(true) {
            log::debug!("DTR not asserted: {}", e);
        }
        if let Err(e) = self.port.write_request_to_send(true) {
            log::debug!("RTS not asserted: {}", e);
        }
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.port.write(data)?)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}
