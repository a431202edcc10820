//! Instrument channel and per-role command builders.
//!
//! [`InstrumentChannel`] is the only place that talks to a transport. It adds
//! the instrument name to every failure, logs the wire traffic, and offers
//! the two checks every role needs: the `*IDN?` identity check and the
//! error-queue check after configuration writes.
//!
//! The role modules ([`source`], [`reference`], [`scanner`]) wrap a channel
//! and expose typed operations; the exact SCPI text stays inside them.

pub mod reference;
pub mod scanner;
pub mod source;

use crate::adapters::{open_transport, ScpiTransport};
use crate::config::TransportConfig;
use crate::error::{AppResult, CalError};
use tracing::{debug, warn};

/// Command that starts an acquisition an instrument has been armed for.
///
/// Returned by an arm operation and consumed by the matching fire. Keeping it
/// as a value lets the sampler issue two fires back to back with nothing in
/// between.
#[must_use = "an armed instrument does nothing until its trigger is fired"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerToken(String);

impl TriggerToken {
    pub(crate) fn new(command: &str) -> Self {
        Self(command.to_string())
    }

    pub fn command(&self) -> &str {
        &self.0
    }
}

/// Command/response channel to one named instrument.
pub struct InstrumentChannel {
    name: String,
    address: String,
    transport: Box<dyn ScpiTransport>,
}

impl InstrumentChannel {
    /// Open the transport described by `config`.
    pub async fn open(name: &str, config: &TransportConfig) -> AppResult<Self> {
        let transport = open_transport(name, config).await?;
        debug!("{} connected via {}", name, transport.info());
        Ok(Self {
            name: name.to_string(),
            address: config.address(),
            transport,
        })
    }

    /// Wrap an already connected transport.
    pub fn from_transport(name: &str, transport: Box<dyn ScpiTransport>) -> Self {
        let address = transport.info();
        Self {
            name: name.to_string(),
            address,
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a command; no reply is expected.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!("{} <- {}", self.name, command);
        self.transport
            .write(command)
            .await
            .map_err(|e| self.protocol_error(command, format!("{:#}", e)))
    }

    /// Send a command and return its trimmed, non-empty reply.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let reply = self
            .transport
            .query(command)
            .await
            .map_err(|e| self.protocol_error(command, format!("{:#}", e)))?;
        let reply = reply.trim().to_string();
        debug!("{} <- {} -> {}", self.name, command, reply);
        if reply.is_empty() {
            return Err(self.protocol_error(command, "empty reply".to_string()));
        }
        Ok(reply)
    }

    /// Query a number. Unparsable replies are protocol errors.
    pub async fn query_f64(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.query(command).await?;
        reply
            .parse::<f64>()
            .map_err(|_| self.protocol_error(command, format!("not a number: \"{}\"", reply)))
    }

    /// Fail unless `*IDN?` mentions `expected`.
    pub async fn verify_identity(&mut self, expected: &str) -> AppResult<String> {
        let identity = self.query("*IDN?").await?;
        if !identity.contains(expected) {
            return Err(CalError::IdentityMismatch {
                instrument: self.name.clone(),
                expected: expected.to_string(),
                reported: identity,
            });
        }
        Ok(identity)
    }

    /// Read the error queue after `stage`; anything not starting with
    /// `ok_prefix` is a fatal configuration error.
    pub async fn check_errors(&mut self, stage: &str, ok_prefix: &str) -> AppResult<()> {
        let status = self.query("SYST:ERR?").await?;
        if !status.starts_with(ok_prefix) {
            return Err(CalError::Configuration {
                instrument: self.name.clone(),
                stage: stage.to_string(),
                status,
            });
        }
        Ok(())
    }

    /// Send a trigger command returned by an arm operation.
    pub async fn fire(&mut self, token: TriggerToken) -> AppResult<()> {
        self.write(token.command()).await
    }

    /// Release the transport. Failures are logged, not returned.
    pub async fn close(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("{}: disconnect failed: {:#}", self.name, e);
        }
    }

    fn protocol_error(&self, command: &str, reason: String) -> CalError {
        CalError::Protocol {
            instrument: self.name.clone(),
            command: command.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::InstrumentChannel;
    use crate::adapters::{MockAdapter, ScpiTransport};

    /// Connected channel over a scripted mock, plus a handle to the script.
    pub async fn mock_channel(name: &str) -> (InstrumentChannel, MockAdapter) {
        let mock = MockAdapter::new();
        let mut transport = mock.clone();
        transport.connect().await.unwrap();
        (
            InstrumentChannel::from_transport(name, Box::new(transport)),
            mock,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::mock_channel;
    use super::*;

    #[tokio::test]
    async fn test_identity_check() {
        let (mut channel, mock) = mock_channel("reference").await;
        mock.reply("*IDN?", "Keysight Technologies,34465A,MY1234,A.02.17");
        assert!(channel.verify_identity("34465A").await.is_ok());

        let err = channel.verify_identity("DMM6500").await.unwrap_err();
        assert!(matches!(err, CalError::IdentityMismatch { .. }));
        assert_eq!(err.instrument(), Some("reference"));
    }

    #[tokio::test]
    async fn test_error_queue_check() {
        let (mut channel, mock) = mock_channel("source").await;
        mock.reply_once("SYST:ERR?", "+0,\"No error\"")
            .reply_once("SYST:ERR?", "-222,\"Data out of range\"");

        channel.check_errors("init", "+0").await.unwrap();
        match channel.check_errors("init", "+0").await {
            Err(CalError::Configuration { stage, status, .. }) => {
                assert_eq!(stage, "init");
                assert!(status.starts_with("-222"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_reply_is_protocol_error() {
        let (mut channel, mock) = mock_channel("scanner").await;
        mock.reply("FETCH?", "  \r\n");
        assert!(matches!(
            channel.query("FETCH?").await,
            Err(CalError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_f64_parses_scientific() {
        let (mut channel, mock) = mock_channel("reference").await;
        mock.reply("CURR:DC:RANG?", "+1.00000000E-01");
        assert_eq!(channel.query_f64("CURR:DC:RANG?").await.unwrap(), 0.1);

        mock.reply("FETCH?", "garbage");
        assert!(channel.query_f64("FETCH?").await.is_err());
    }

    #[tokio::test]
    async fn test_fire_sends_token_command() {
        let (mut channel, mock) = mock_channel("reference").await;
        channel.fire(TriggerToken::new("*TRG")).await.unwrap();
        assert_eq!(mock.commands(), vec!["*TRG"]);
    }
}
