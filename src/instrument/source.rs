//! Bipolar current source (HP 66332A with the output relay option)
//!
//! The supply itself only sources positive current. The sign of the stimulus
//! is realised by the polarity relay, so every programmed level is a
//! magnitude and polarity changes are a separate, slower operation.

use super::InstrumentChannel;
use crate::error::AppResult;
use std::fmt;
use tracing::info;

/// Error-queue prefix of the 66332A when nothing is wrong.
const NO_ERROR: &str = "+0";

/// Voltage compliance while sourcing current.
const COMPLIANCE_VOLTS: f64 = 10.0;

/// Output relay polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Normal,
    Reversed,
}

impl Polarity {
    /// Polarity needed for a signed stimulus; zero counts as normal.
    pub fn of(value: f64) -> Self {
        if value < 0.0 {
            Polarity::Reversed
        } else {
            Polarity::Normal
        }
    }

    fn wire(self) -> &'static str {
        match self {
            Polarity::Normal => "NORM",
            Polarity::Reversed => "REV",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire())
    }
}

pub struct CurrentSource {
    channel: InstrumentChannel,
}

impl CurrentSource {
    pub fn new(channel: InstrumentChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &InstrumentChannel {
        &self.channel
    }

    /// Clear status, check identity, and park the output at zero.
    pub async fn init(&mut self, expected_identity: &str) -> AppResult<()> {
        self.channel.write("*CLS").await?;
        let identity = self.channel.verify_identity(expected_identity).await?;
        info!("Current source: {}", identity);

        self.channel.write("OUTP 0").await?;
        self.set_polarity(Polarity::Normal).await?;
        self.channel
            .write(&format!("SOUR:VOLT {}", COMPLIANCE_VOLTS))
            .await?;
        self.channel.write("SOUR:CURR 0").await?;
        self.channel.check_errors("init", NO_ERROR).await
    }

    pub async fn set_polarity(&mut self, polarity: Polarity) -> AppResult<()> {
        self.channel
            .write(&format!("OUTP:REL:POL {}", polarity))
            .await
    }

    /// Program the current magnitude; the sign is ignored.
    pub async fn set_magnitude(&mut self, amps: f64) -> AppResult<()> {
        self.channel
            .write(&format!("SOUR:CURR {:.5}", amps.abs()))
            .await
    }

    pub async fn output_on(&mut self) -> AppResult<()> {
        self.channel.write("OUTP 1").await
    }

    /// Error queue check after a stimulus change.
    pub async fn check_errors(&mut self, stage: &str) -> AppResult<()> {
        self.channel.check_errors(stage, NO_ERROR).await
    }

    /// Output off, polarity normal, zero volts, zero amps.
    pub async fn idle(&mut self) -> AppResult<()> {
        self.channel.write("OUTP 0").await?;
        self.set_polarity(Polarity::Normal).await?;
        self.channel.write("SOUR:VOLT 0").await?;
        self.channel.write("SOUR:CURR 0").await
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}
