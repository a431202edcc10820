//! Multiplexed meter: DMM6500 with a SCAN2000 card
//!
//! One meter, several relay-switched inputs. Each sample routes exactly one
//! channel, measures it, and leaves every relay open again. The fetch reply
//! echoes the channel and a status code; both are checked before a value is
//! accepted.

use super::{InstrumentChannel, TriggerToken};
use crate::error::{AppResult, Rejection};
use crate::measurement::{MeasurementResult, MeasurementSpec, RangeRequest};
use tracing::{info, warn};

const NO_ERROR: &str = "0,\"No error";

/// Reading status codes that still carry a usable value: normal, and normal
/// with a limit flag.
pub const ACCEPTED_STATUS: [i64; 2] = [0, 8];

const FETCH_COMMAND: &str = "FETCH? \"defbuffer1\", READ, CHAN, STAT";

/// `, (@1,11)` style suffix; empty for the front panel.
fn channel_suffix(channels: &[u16]) -> String {
    if channels.is_empty() {
        return String::new();
    }
    let list: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
    format!(", (@{})", list.join(","))
}

/// Integration plan on the scanner: the instrument caps NPLC, longer
/// apertures are made up with a repeating average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aperture {
    pub nplc: u32,
    /// Averaging count; 1 means the filter is off
    pub average: u32,
}

impl Aperture {
    pub fn plan(nplc: u32, nplc_max: u32) -> Self {
        if nplc > nplc_max {
            Self {
                nplc: nplc_max,
                average: nplc.div_ceil(nplc_max),
            }
        } else {
            Self { nplc, average: 1 }
        }
    }
}

/// Validate a `READ, CHAN, STAT` reply against the requested channel.
///
/// The echoed channel is only checked for scanner channels; the front panel
/// has none.
pub fn parse_channel_reply(reply: &str, channel: u16, range: f64) -> MeasurementResult {
    let rejected = |rejection| MeasurementResult::Rejected { rejection, range };

    let fields: Vec<&str> = reply.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return rejected(Rejection::MalformedReply(reply.to_string()));
    }

    if channel != 0 {
        match fields[1].parse::<u16>() {
            Ok(echoed) if echoed == channel => {}
            Ok(_) => {
                return rejected(Rejection::ChannelMismatch {
                    requested: channel,
                    reported: fields[1].to_string(),
                })
            }
            Err(_) => return rejected(Rejection::MalformedReply(reply.to_string())),
        }
    }

    match fields[2].parse::<i64>() {
        Ok(status) if ACCEPTED_STATUS.contains(&status) => {}
        Ok(_) => return rejected(Rejection::StatusMismatch(fields[2].to_string())),
        Err(_) => return rejected(Rejection::MalformedReply(reply.to_string())),
    }

    match fields[0].parse::<f64>() {
        Ok(value) => MeasurementResult::Valid { value, range },
        Err(_) => rejected(Rejection::MalformedReply(reply.to_string())),
    }
}

pub struct ScannerMeter {
    channel: InstrumentChannel,
    nplc_max: u32,
    auto_zero: bool,
    display_off: bool,
}

impl ScannerMeter {
    pub fn new(channel: InstrumentChannel, nplc_max: u32) -> Self {
        Self {
            channel,
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

    /// Identity check and DC voltage setup on every listed channel.
    pub async fn init(&mut self, expected_identity: &str, channels: &[u16]) -> AppResult<()> {
        self.channel.write("*CLS").await?;
        let identity = self.channel.verify_identity(expected_identity).await?;
        info!("Scanner meter: {}", identity);

        let suffix = channel_suffix(channels);
        let zero = if self.auto_zero { 1 } else { 0 };
        for command in [
            "SENS:FUNC 'VOLT'".to_string(),
            "VOLT:DC:RANG:AUTO 1".to_string(),
            "VOLT:DC:INP AUTO".to_string(),
            "VOLT:DC:LINE:SYNC 0".to_string(),
            format!("VOLT:DC:AZER {}", zero),
        ] {
            self.channel
                .write(&format!("{}{}", command, suffix))
                .await?;
        }
        if self.display_off {
            self.channel.write("DISP:SCR PROC").await?;
        }
        self.channel.check_errors("init", NO_ERROR).await
    }

    /// Route the requested channel and configure one measurement on it.
    pub async fn arm(&mut self, spec: MeasurementSpec, nplc: u32) -> AppResult<TriggerToken> {
        let suffix = if spec.is_front_panel() {
            String::new()
        } else {
            channel_suffix(&[spec.channel])
        };

        self.channel.write("ABOR").await?;
        if !spec.is_front_panel() {
            self.channel.write("ROUT:OPEN:ALL").await?;
            self.channel
                .write(&format!("ROUT:CLOS (@{})", spec.channel))
                .await?;
        }

        let nplc = match spec.range {
            RangeRequest::Auto => {
                self.channel
                    .write(&format!("VOLT:DC:RANG:AUTO 1{}", suffix))
                    .await?;
                1
            }
            RangeRequest::Fixed(range) => {
                self.channel
                    .write(&format!("VOLT:DC:RANG {}{}", range, suffix))
                    .await?;
                nplc
            }
        };

        let aperture = Aperture::plan(nplc, self.nplc_max);
        self.channel
            .write(&format!("SENS:VOLT:NPLC {}{}", aperture.nplc, suffix))
            .await?;
        if aperture.average <= 1 {
            self.channel
                .write(&format!("VOLT:DC:AVER 0{}", suffix))
                .await?;
        } else {
            self.channel
                .write(&format!("VOLT:DC:AVER:COUNT {}{}", aperture.average, suffix))
                .await?;
            self.channel
                .write(&format!("VOLT:DC:AVER:TCON REP{}", suffix))
                .await?;
            self.channel
                .write(&format!("VOLT:DC:AVER:STAT 1{}", suffix))
                .await?;
        }
        self.channel
            .check_errors("measurement setup", NO_ERROR)
            .await?;

        self.channel.write("TRIG:LOAD \"SimpleLoop\", 1").await?;
        Ok(TriggerToken::new("INIT"))
    }

    pub async fn fire(&mut self, token: TriggerToken) -> AppResult<()> {
        self.channel.fire(token).await
    }

    /// Fetch and validate the reading, then open the channel's relay again.
    ///
    /// The relays are opened even when the read-back fails; that error wins
    /// over a failure to open them.
    pub async fn fetch(&mut self, spec: MeasurementSpec) -> AppResult<MeasurementResult> {
        let read_back = self.read_back().await;
        if !spec.is_front_panel() {
            let opened = self.open_relays(spec.channel).await;
            if read_back.is_ok() {
                opened?;
            }
        }

        let (reply, range) = read_back?;
        let result = parse_channel_reply(&reply, spec.channel, range);
        if let Some(rejection) = result.rejection() {
            warn!("scanner channel {}: {}", spec.channel, rejection);
        }
        Ok(result)
    }

    async fn read_back(&mut self) -> AppResult<(String, f64)> {
        self.channel.write("*WAI").await?;
        let reply = self.channel.query(FETCH_COMMAND).await?;
        let range = self.channel.query_f64("VOLT:DC:RANG?").await?;
        Ok((reply, range))
    }

    async fn open_relays(&mut self, channel: u16) -> AppResult<()> {
        self.channel
            .write(&format!("ROUT:OPEN (@{})", channel))
            .await?;
        self.channel.write("ROUT:OPEN:ALL").await
    }

    /// All relays open, home screen back.
    pub async fn idle(&mut self) -> AppResult<()> {
        self.channel.write("ROUT:OPEN:ALL").await?;
        self.channel.write("DISP:SCR HOME").await
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}
