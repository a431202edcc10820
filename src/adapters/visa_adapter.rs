//! VISA adapter for GPIB/USB/LXI instruments
//!
//! VISA I/O is blocking, so every call runs on Tokio's blocking pool with
//! the session behind a mutex.
//!
//! Accepted resource strings include:
//! - "GPIB0::1::INSTR"
//! - "TCPIP0::192.168.7.201::INSTR"
//! - "USB0::0x05E6::0x6500::04412345::INSTR"

use super::ScpiTransport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use super::LINE_TERMINATOR;
#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Open session plus the resource manager that owns it.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    // closing the manager closes every session opened through it
    _rm: DefaultRM,
    instrument: Instrument,
}

pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::1::INSTR")
    pub(crate) resource_string: String,

    /// Open timeout
    pub(crate) timeout: Duration,

    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaAdapter {
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_secs(5),
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> Result<Arc<Mutex<VisaSession>>> {
        self.session
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("VISA resource '{}' not connected", self.resource_string))
    }
}

#[cfg(feature = "instrument_visa")]
fn send_line(instrument: &Instrument, command: &str) -> Result<()> {
    use std::io::Write;

    let mut writer = instrument;
    writer
        .write_all(format!("{}{}", command, LINE_TERMINATOR).as_bytes())
        .with_context(|| format!("VISA write failed for: {}", command))?;
    debug!("VISA command sent: {}", command);
    Ok(())
}

#[cfg(feature = "instrument_visa")]
fn read_reply(instrument: &Instrument, command: &str) -> Result<String> {
    use std::io::{BufRead, BufReader};

    let mut response = String::new();
    BufReader::new(instrument)
        .read_line(&mut response)
        .with_context(|| format!("VISA read failed for: {}", command))?;
    let response = response.trim().to_string();
    debug!("VISA query '{}' -> '{}'", command, response);
    Ok(response)
}

#[async_trait]
impl ScpiTransport for VisaAdapter {
    fn adapter_type(&self) -> &str {
        "visa"
    }

    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.session.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    async fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource_string.clone();
            let timeout = self.timeout;

            let session = tokio::task::spawn_blocking(move || -> Result<VisaSession> {
                let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
                let name = std::ffi::CString::new(resource.as_str())
                    .context("Resource string contains a NUL byte")?;
                let instrument = rm
                    .open(&name.into(), AccessMode::NO_LOCK, timeout)
                    .with_context(|| format!("Failed to open VISA resource: {}", resource))?;
                Ok(VisaSession {
                    _rm: rm,
                    instrument,
                })
            })
            .await
            .context("VISA open task panicked")??;

            self.session = Some(Arc::new(Mutex::new(session)));
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(anyhow!(
                "VISA support not enabled. Rebuild with --features instrument_visa"
            ))
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.session.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            let command = command.to_string();
            tokio::task::spawn_blocking(move || {
                let guard = session.blocking_lock();
                send_line(&guard.instrument, &command)
            })
            .await
            .context("VISA write task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(anyhow!(
                "VISA support not enabled. Rebuild with --features instrument_visa"
            ))
        }
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session()?;
            let command = command.to_string();
            tokio::task::spawn_blocking(move || {
                let guard = session.blocking_lock();
                send_line(&guard.instrument, &command)?;
                read_reply(&guard.instrument, &command)
            })
            .await
            .context("VISA I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(anyhow!(
                "VISA support not enabled. Rebuild with --features instrument_visa"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::1::INSTR".to_string());
        assert_eq!(adapter.adapter_type(), "visa");
        assert!(!adapter.is_connected());
        assert_eq!(adapter.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_info_string() {
        let adapter = VisaAdapter::new("TCPIP0::192.168.7.205::INSTR".to_string())
            .with_timeout(Duration::from_millis(3000));
        let info = adapter.info();
        assert!(info.contains("TCPIP0::192.168.7.205::INSTR"));
        assert!(info.contains("3000ms"));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_connect_without_feature_fails() {
        let mut adapter = VisaAdapter::new("GPIB0::1::INSTR".to_string());
        assert!(adapter.connect().await.is_err());
    }
}
