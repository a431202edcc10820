//! Prologix-style USB/serial to GPIB bridge
//!
//! The bridge is a controller on the GPIB bus and a plain serial port on the
//! host side. Lines starting with `++` configure the bridge itself; anything
//! else is forwarded to the instrument at the selected GPIB address. With
//! auto-read off, the bridge only addresses the instrument to talk after an
//! explicit `++read eoi`, so every query needs that poke.

use super::{ScpiTransport, LINE_TERMINATOR};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use anyhow::Context;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Poke that makes the bridge read one reply from the addressed instrument.
pub const READ_POKE: &str = "++read eoi";

/// Serial adapter for an instrument behind a Prologix GPIB bridge
pub struct PrologixAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    baud_rate: u32,

    /// GPIB primary address of the instrument
    gpib_address: u8,

    /// Bridge auto-read mode
    auto_read: bool,

    /// Reply timeout
    timeout: Duration,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl PrologixAdapter {
    /// Create an adapter; nothing is opened until [`ScpiTransport::connect`].
    pub fn new(port_name: String, baud_rate: u32, gpib_address: u8) -> Self {
        Self {
            port_name,
            baud_rate,
            gpib_address,
            auto_read: false,
            timeout: Duration::from_millis(100),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bridge setup sequence: controller mode, read mode, no terminator
    /// rewriting, instrument address.
    pub fn setup_commands(&self) -> Vec<String> {
        vec![
            "++mode 1".to_string(),
            format!("++auto {}", u8::from(self.auto_read)),
            "++eos 0".to_string(),
            format!("++addr {}", self.gpib_address),
            "++read".to_string(),
        ]
    }

    /// Lines sent for a query, poke included when needed.
    pub fn query_lines(&self, command: &str) -> Vec<String> {
        let mut lines = vec![command.to_string()];
        if !self.auto_read {
            lines.push(READ_POKE.to_string());
        }
        lines
    }
}

/// Bytes on the wire for one command line.
pub fn frame(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + LINE_TERMINATOR.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(LINE_TERMINATOR.as_bytes());
    bytes
}

#[cfg(feature = "instrument_serial")]
fn send_lines(port: &mut dyn SerialPort, lines: &[String]) -> Result<()> {
    use std::io::Write;

    for line in lines {
        port.write_all(&frame(line))
            .context("Failed to write to serial port")?;
        debug!("Sent serial command: {}", line);
    }
    port.flush().context("Failed to flush serial port")?;
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn read_line(port: &mut dyn SerialPort, timeout: Duration) -> Result<String> {
    use std::io::Read;

    let mut response = Vec::new();
    let mut buffer = [0u8; 1];
    let start = std::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(anyhow!(
                "no reply within {:?} (partial: {:?})",
                timeout,
                String::from_utf8_lossy(&response)
            ));
        }

        match port.read(&mut buffer) {
            Ok(1) => {
                response.push(buffer[0]);
                if buffer[0] == b'\n' {
                    break;
                }
            }
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(anyhow!("Serial read error: {}", e)),
        }
    }

    let response = String::from_utf8(response)
        .map_err(|_| anyhow!("reply is not ASCII text"))?
        .trim()
        .to_string();
    debug!("Received serial response: {}", response);
    Ok(response)
}

#[async_trait]
impl ScpiTransport for PrologixAdapter {
    fn adapter_type(&self) -> &str {
        "prologix"
    }

    fn info(&self) -> String {
        format!(
            "PrologixAdapter({} @ {} baud, GPIB {}, auto-read {})",
            self.port_name,
            self.baud_rate,
            self.gpib_address,
            if self.auto_read { "on" } else { "off" }
        )
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(self.timeout)
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        self.port_name, self.baud_rate
                    )
                })?;
            let port = Arc::new(Mutex::new(port));
            let setup = self.setup_commands();
            let port_clone = port.clone();

            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut guard = port_clone.blocking_lock();
                send_lines(&mut **guard, &setup)?;
                // drop whatever the bridge echoed while being configured
                guard
                    .clear(serialport::ClearBuffer::Input)
                    .context("Failed to clear serial input buffer")?;
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")??;

            self.port = Some(port);
            debug!(
                "Prologix bridge on '{}' addressing GPIB {}",
                self.port_name, self.gpib_address
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| anyhow!("Serial port '{}' not connected", self.port_name))?
                .clone();
            let lines = vec![command.to_string()];

            tokio::task::spawn_blocking(move || {
                let mut guard = port.blocking_lock();
                send_lines(&mut **guard, &lines)
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| anyhow!("Serial port '{}' not connected", self.port_name))?
                .clone();
            let lines = self.query_lines(command);
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> Result<String> {
                let mut guard = port.blocking_lock();
                send_lines(&mut **guard, &lines)?;
                read_line(&mut **guard, timeout)
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_creation() {
        let adapter = PrologixAdapter::new("/dev/ttyUSB0".to_string(), 38400, 1);
        assert_eq!(adapter.adapter_type(), "prologix");
        assert!(!adapter.is_connected());
        assert_eq!(adapter.timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_frame_appends_crlf() {
        assert_eq!(frame("*IDN?"), b"*IDN?\r\n".to_vec());
    }

    #[test]
    fn test_setup_sequence() {
        let adapter = PrologixAdapter::new("COM3".to_string(), 38400, 5);
        assert_eq!(
            adapter.setup_commands(),
            vec!["++mode 1", "++auto 0", "++eos 0", "++addr 5", "++read"]
        );
        let adapter = adapter.with_auto_read(true);
        assert_eq!(adapter.setup_commands()[1], "++auto 1");
    }

    #[test]
    fn test_query_needs_read_poke_without_auto_read() {
        let adapter = PrologixAdapter::new("COM3".to_string(), 38400, 1);
        assert_eq!(adapter.query_lines("SYST:ERR?"), vec!["SYST:ERR?", "++read eoi"]);
        let adapter = adapter.with_auto_read(true);
        assert_eq!(adapter.query_lines("SYST:ERR?"), vec!["SYST:ERR?"]);
    }

    #[test]
    fn test_info_string() {
        let adapter = PrologixAdapter::new("/dev/cu.usbmodem31401".to_string(), 38400, 1);
        let info = adapter.info();
        assert!(info.contains("/dev/cu.usbmodem31401"));
        assert!(info.contains("GPIB 1"));
    }
}
