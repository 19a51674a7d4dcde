//! Serial transport
//!
//! Byte-level access to the serial device. The protocol engine only ever
//! sees the [`Transport`] trait, so tests and alternative backends can
//! substitute their own implementation.

use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::LinkError;
use crate::DEFAULT_BAUD_RATE;

/// Byte-level transport collaborator consumed by the synchronizer
pub trait Transport: Send {
    /// Open the underlying device
    fn open(&mut self) -> Result<(), LinkError>;

    /// Whether the device is currently open
    fn is_open(&self) -> bool;

    /// Close the device and release its resources
    fn close(&mut self);

    /// Discard any buffered input
    fn discard(&mut self);

    /// Read one byte, or `None` if nothing arrived within the timeout
    fn read_byte(&mut self) -> Option<u8>;

    /// Write a buffer, returning the number of bytes written
    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError>;

    /// Set the timeout used by [`Transport::read_byte`]
    fn set_timeout(&mut self, timeout: Duration);
}

/// Serial line configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/ttyUSB0" or "COM4")
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Number of data bits
    pub data_bits: DataBits,
    /// Parity mode
    pub parity: Parity,
    /// Number of stop bits
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// Configuration for the given device with standard 8-N-1 framing
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            ..Self::default()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// [`Transport`] backed by a real serial port
pub struct SerialTransport {
    config: SerialConfig,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Create a transport for the given configuration; the device is opened
    /// lazily on first use
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            timeout: Duration::from_millis(10),
            port: None,
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.config.path, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .parity(self.config.parity)
            .stop_bits(self.config.stop_bits)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(|e| LinkError::Transport(e.to_string()))?;

        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn discard(&mut self) {
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
                tracing::warn!("failed to discard input buffer: {}", e);
            }
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let port = self.port.as_mut()?;
        let mut buf = [0u8; 1];
        match port.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            Ok(_) => None,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                None
            }
            Err(e) => {
                tracing::warn!("serial read error: {}", e);
                None
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;
        port.write_all(buf)
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        Ok(buf.len())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.set_timeout(timeout) {
                tracing::warn!("failed to set serial timeout: {}", e);
            }
        }
    }
}

/// List the names of the serial ports available on this machine
pub fn available_ports() -> Vec<String> {
    let mut names: Vec<String> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
        assert_eq!(config.path, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
    }

    #[test]
    fn test_unopened_transport() {
        let mut transport = SerialTransport::new(SerialConfig::default());
        assert!(!transport.is_open());
        assert!(transport.read_byte().is_none());
        assert!(matches!(transport.write(&[0xAA]), Err(LinkError::NotOpen)));
    }

    #[test]
    fn test_available_ports_does_not_panic() {
        let _ = available_ports();
    }
}
