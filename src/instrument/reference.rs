//! Reference meter (Keysight 34465A)
//!
//! Triggered from the bus: arming leaves the meter waiting in the trigger
//! layer and the returned token is `*TRG`.

use super::{InstrumentChannel, TriggerToken};
use crate::error::{AppResult, Rejection};
use crate::measurement::{MeasurementResult, RangeRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

const NO_ERROR: &str = "+0";

/// Quantity the reference meter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureFunction {
    #[serde(rename = "CURR:DC")]
    DcCurrent,
    #[serde(rename = "VOLT:DC")]
    DcVoltage,
}

impl MeasureFunction {
    pub fn wire(self) -> &'static str {
        match self {
            MeasureFunction::DcCurrent => "CURR:DC",
            MeasureFunction::DcVoltage => "VOLT:DC",
        }
    }

    pub fn is_current(self) -> bool {
        matches!(self, MeasureFunction::DcCurrent)
    }
}

impl fmt::Display for MeasureFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire())
    }
}

pub struct ReferenceMeter {
    channel: InstrumentChannel,
    function: MeasureFunction,
    nplc_max: u32,
    auto_zero: bool,
    display_off: bool,
}

impl ReferenceMeter {
    pub fn new(channel: InstrumentChannel, function: MeasureFunction, nplc_max: u32) -> Self {
        Self {
            channel,
            function,
            nplc_max,
            auto_zero: false,
            display_off: false,
        }
    }

    pub fn with_auto_zero(mut self, auto_zero: bool) -> Self {
        self.auto_zero = auto_zero;
        self
    }

    pub fn with_display_off(mut self, display_off: bool) -> Self {
        self.display_off = display_off;
        self
    }

    pub fn channel(&self) -> &InstrumentChannel {
        &self.channel
    }

    pub fn function(&self) -> MeasureFunction {
        self.function
    }

    pub async fn init(&mut self, expected_identity: &str) -> AppResult<()> {
        self.channel.write("*CLS").await?;
        let identity = self.channel.verify_identity(expected_identity).await?;
        info!("Reference meter: {}", identity);

        self.channel
            .write(&format!("CONF:{} AUTO", self.function))
            .await?;
        if self.display_off {
            self.channel.write("DISP OFF").await?;
        }
        self.channel.check_errors("init", NO_ERROR).await
    }

    /// NPLC actually programmed for a request: auto probes run at 1.
    pub fn effective_nplc(&self, range: RangeRequest, nplc: u32) -> u32 {
        if range.is_auto() {
            1
        } else {
            nplc.min(self.nplc_max)
        }
    }

    /// Configure one bus-triggered measurement.
    pub async fn arm(&mut self, range: RangeRequest, nplc: u32) -> AppResult<TriggerToken> {
        let function = self.function;
        let nplc = self.effective_nplc(range, nplc);

        // CONF resets the rest of the measurement setup, so it goes first
        self.channel
            .write(&format!("CONF:{} {}", function, range))
            .await?;
        if function.is_current() {
            self.channel.write("SENS:CURR:DC:TERM 3").await?;
        }
        self.channel
            .write(&format!("SENS:{}:NPLC {}", function, nplc))
            .await?;
        let zero = if self.auto_zero { "ON" } else { "OFF" };
        self.channel
            .write(&format!("SENS:{}:ZERO:AUTO {}", function, zero))
            .await?;
        self.channel
            .check_errors("measurement setup", NO_ERROR)
            .await?;

        self.channel.write("TRIG:SOUR BUS").await?;
        self.channel.write("INIT").await?;
        Ok(TriggerToken::new("*TRG"))
    }

    pub async fn fire(&mut self, token: TriggerToken) -> AppResult<()> {
        self.channel.fire(token).await
    }

    /// Wait for the triggered reading and the range it was taken on.
    ///
    /// An unparsable reading is rejected; an unparsable range is a protocol
    /// error.
    pub async fn fetch(&mut self) -> AppResult<MeasurementResult> {
        self.channel.write("*WAI").await?;
        let reading = self.channel.query("FETCH?").await?;
        let range = self
            .channel
            .query_f64(&format!("{}:RANG?", self.function))
            .await?;

        match reading.parse::<f64>() {
            Ok(value) => Ok(MeasurementResult::Valid { value, range }),
            Err(_) => {
                warn!("reference: unreadable reading \"{}\"", reading);
                Ok(MeasurementResult::Rejected {
                    rejection: Rejection::MalformedReply(reading),
                    range,
                })
            }
        }
    }

    /// Display back on, front panel unlocked.
    pub async fn idle(&mut self) -> AppResult<()> {
        self.channel.write("DISP ON").await?;
        self.channel.write("SYST:LOC").await
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::testing::mock_channel;

    const NO_ERR: &str = "+0,\"No error\"";

    #[tokio::test]
    async fn test_init_with_display_off() {
        let (channel, mock) = mock_channel("reference").await;
        mock.reply("*IDN?", "Keysight Technologies,34465A,MY59001234,A.03.01-02.40")
            .reply("SYST:ERR?", NO_ERR);
        let mut meter =
            ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100).with_display_off(true);
        meter.init("34465A").await.unwrap();
        assert_eq!(
            mock.commands(),
            vec!["*CLS", "*IDN?", "CONF:CURR:DC AUTO", "DISP OFF", "SYST:ERR?"]
        );
    }

    #[tokio::test]
    async fn test_arm_fixed_range() {
        let (channel, mock) = mock_channel("reference").await;
        mock.reply("SYST:ERR?", NO_ERR);
        let mut meter = ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100);
        let token = meter.arm(RangeRequest::Fixed(0.01), 10).await.unwrap();

        assert_eq!(token.command(), "*TRG");
        assert_eq!(
            mock.commands(),
            vec![
                "CONF:CURR:DC 0.01",
                "SENS:CURR:DC:TERM 3",
                "SENS:CURR:DC:NPLC 10",
                "SENS:CURR:DC:ZERO:AUTO OFF",
                "SYST:ERR?",
                "TRIG:SOUR BUS",
                "INIT"
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_probe_runs_fast_and_voltage_skips_terminals() {
        let (channel, mock) = mock_channel("reference").await;
        mock.reply("SYST:ERR?", NO_ERR);
        let mut meter =
            ReferenceMeter::new(channel, MeasureFunction::DcVoltage, 100).with_auto_zero(true);
        let _token = meter.arm(RangeRequest::Auto, 50).await.unwrap();

        let commands = mock.commands();
        assert_eq!(commands[0], "CONF:VOLT:DC AUTO");
        assert_eq!(commands[1], "SENS:VOLT:DC:NPLC 1");
        assert_eq!(commands[2], "SENS:VOLT:DC:ZERO:AUTO ON");
    }

    #[tokio::test]
    async fn test_nplc_capped() {
        let (channel, _mock) = mock_channel("reference").await;
        let meter = ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100);
        assert_eq!(meter.effective_nplc(RangeRequest::Fixed(1.0), 200), 100);
        assert_eq!(meter.effective_nplc(RangeRequest::Fixed(1.0), 10), 10);
        assert_eq!(meter.effective_nplc(RangeRequest::Auto, 10), 1);
    }

    #[tokio::test]
    async fn test_setup_error_is_fatal() {
        let (channel, mock) = mock_channel("reference").await;
        mock.reply("SYST:ERR?", "-113,\"Undefined header\"");
        let mut meter = ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100);
        assert!(meter.arm(RangeRequest::Fixed(1.0), 10).await.is_err());
        assert!(!mock.commands().contains(&"INIT".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_value_and_range() {
        let (channel, mock) = mock_channel("reference").await;
        mock.reply("FETCH?", "+8.49871200E-03")
            .reply("CURR:DC:RANG?", "+1.00000000E-02");
        let mut meter = ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100);
        let result = meter.fetch().await.unwrap();
        assert_eq!(result.value(), Some(8.498712e-3));
        assert_eq!(result.range(), 0.01);
        assert_eq!(mock.commands()[0], "*WAI");
    }

    #[tokio::test]
    async fn test_garbled_reading_is_rejected_not_fatal() {
        let (channel, mock) = mock_channel("reference").await;
        mock.reply("FETCH?", "+9.9E+37,OVLD")
            .reply("CURR:DC:RANG?", "+1.00000000E-01");
        let mut meter = ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100);
        let result = meter.fetch().await.unwrap();
        assert_eq!(result.value(), None);
        assert_eq!(result.range(), 0.1);
    }

    #[tokio::test]
    async fn test_idle() {
        let (channel, mock) = mock_channel("reference").await;
        let mut meter = ReferenceMeter::new(channel, MeasureFunction::DcCurrent, 100);
        meter.idle().await.unwrap();
        assert_eq!(mock.commands(), vec!["DISP ON", "SYST:LOC"]);
    }
}
