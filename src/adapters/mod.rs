//! Transport adapters
//!
//! An adapter moves one ASCII command line to an instrument and, for queries,
//! one reply line back. Everything above this layer is transport-agnostic:
//! the Prologix bridge needs an explicit read poke per query, a LAN
//! instrument does not, and neither detail leaks out of its adapter.

pub mod mock;
pub mod serial_adapter;
pub mod tcp_adapter;
pub mod visa_adapter;

pub use mock::MockAdapter;
pub use serial_adapter::PrologixAdapter;
pub use tcp_adapter::TcpAdapter;
pub use visa_adapter::VisaAdapter;

use crate::config::TransportConfig;
use crate::error::{AppResult, CalError};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Line terminator for every command sent to an instrument.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Command/response transport to a single instrument address.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Short adapter kind (e.g., "prologix", "tcp")
    fn adapter_type(&self) -> &str;

    /// Human-readable description for diagnostics
    fn info(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Send a command; no reply is read.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read one reply line (trimmed).
    async fn query(&mut self, command: &str) -> Result<String>;
}

/// Build and connect the adapter described by `config`.
pub async fn open_transport(
    instrument: &str,
    config: &TransportConfig,
) -> AppResult<Box<dyn ScpiTransport>> {
    let mut transport: Box<dyn ScpiTransport> = match config {
        TransportConfig::Prologix {
            port,
            gpib_address,
            baud_rate,
            auto_read,
            timeout_ms,
        } => {
            if !cfg!(feature = "instrument_serial") {
                return Err(CalError::FeatureNotEnabled("instrument_serial".to_string()));
            }
            Box::new(
                PrologixAdapter::new(port.clone(), *baud_rate, *gpib_address)
                    .with_auto_read(*auto_read)
                    .with_timeout(Duration::from_millis(*timeout_ms)),
            )
        }
        TransportConfig::Tcp {
            host,
            port,
            timeout_ms,
        } => Box::new(
            TcpAdapter::new(host.clone(), *port)
                .with_timeout(Duration::from_millis(*timeout_ms)),
        ),
        TransportConfig::Visa {
            resource,
            timeout_ms,
        } => {
            if !cfg!(feature = "instrument_visa") {
                return Err(CalError::FeatureNotEnabled("instrument_visa".to_string()));
            }
            Box::new(
                VisaAdapter::new(resource.clone())
                    .with_timeout(Duration::from_millis(*timeout_ms)),
            )
        }
    };

    transport
        .connect()
        .await
        .map_err(|e| CalError::Connection {
            instrument: instrument.to_string(),
            address: config.address(),
            reason: format!("{:#}", e),
        })?;

    Ok(transport)
}
