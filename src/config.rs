//! Bench configuration using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. built-in defaults (the bench this tool was written for)
//! 2. a TOML file (`scan_cal.toml` unless `--config` says otherwise)
//! 3. environment variables prefixed with `SCAN_CAL_`, `__` separating
//!    nested keys
//!
//! ```text
//! SCAN_CAL_SWEEP__MAX_CURRENT=1.5
//! SCAN_CAL_MEASUREMENT__NPLC=100
//! SCAN_CAL_SOURCE__TRANSPORT__PORT=/dev/ttyUSB0
//! ```
//!
//! # Example file
//!
//! ```toml
//! [sweep]
//! max_current = 2.0
//! step_percent = 5.0
//! resolution = 0.001
//! start = "floor"
//!
//! [measurement]
//! nplc = 10
//! channels = [1, 11]
//!
//! [source.transport]
//! kind = "prologix"
//! port = "/dev/cu.usbmodem31401"
//! gpib_address = 1
//!
//! [reference.transport]
//! kind = "tcp"
//! host = "192.168.7.201"
//! ```

use crate::error::{AppResult, CalError};
use crate::instrument::reference::MeasureFunction;
use crate::range::{RangePolicy, RangeTable};
use crate::sweep::{Sweep, SweepPlan, SweepStart};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "scan_cal.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCAN_CAL_";

/// Meter timeout floor once integrations get long.
const LONG_INTEGRATION_TIMEOUT_MS: u64 = 10_000;

/// Top-level bench configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Stimulus sweep parameters
    pub sweep: SweepConfig,
    /// Measurement setup shared by both meters
    pub measurement: MeasurementConfig,
    /// Settling delays
    pub timing: TimingConfig,
    /// Bipolar current source
    pub source: InstrumentConfig,
    /// Reference (calibrator) meter
    pub reference: InstrumentConfig,
    /// Multiplexed meter with the scanner card
    pub scanner: InstrumentConfig,
    /// Result table
    pub output: OutputConfig,
}

/// Stimulus sweep parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    /// Largest stimulus magnitude in amps
    pub max_current: f64,
    /// Growth per step, in percent of the current magnitude
    pub step_percent: f64,
    /// Smallest step in amps; also the first magnitude when `start = "floor"`
    pub resolution: f64,
    /// Whether the sweep starts at the resolution floor or at zero
    #[serde(default)]
    pub start: SweepStart,
    /// Single stimulus used in test mode
    pub test_value: f64,
}

/// Measurement setup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementConfig {
    /// Integration time in power-line cycles for the real measurements
    pub nplc: u32,
    /// Auto-zero on both meters (better drift, worse timing alignment)
    pub auto_zero: bool,
    /// Switch displays off during the run
    pub display_off: bool,
    /// Let the reference meter discover its own range at every level
    pub auto_range_reference: bool,
    /// What the reference meter measures
    pub reference_function: MeasureFunction,
    /// Ascending bucket thresholds for fixed reference ranges
    pub reference_ranges: Vec<f64>,
    /// Range used above the last bucket
    pub reference_max_range: f64,
    /// Scanner channels, one result column group per channel
    pub channels: Vec<u16>,
}

/// Settling delays in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Wait after every stimulus change
    pub settle_ms: u64,
    /// Additional wait after the polarity relays switched
    pub polarity_settle_ms: u64,
    /// Wait after enabling the output, for constant-current mode to engage
    pub output_on_settle_ms: u64,
}

/// One instrument on the bench
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    /// How to reach the instrument
    pub transport: TransportConfig,
    /// Model string that must appear in the `*IDN?` reply
    pub expected_identity: String,
    /// Largest NPLC the instrument accepts
    #[serde(default = "default_nplc_max")]
    pub nplc_max: u32,
}

/// Transport definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Prologix-style USB/serial to GPIB bridge
    Prologix {
        /// Serial device (e.g., "/dev/ttyUSB0", "COM3")
        port: String,
        /// GPIB primary address of the instrument behind the bridge
        gpib_address: u8,
        /// Serial baud rate
        #[serde(default = "default_prologix_baud")]
        baud_rate: u32,
        /// Bridge auto-read mode; when off every query needs a read poke
        #[serde(default)]
        auto_read: bool,
        /// Read timeout in milliseconds
        #[serde(default = "default_prologix_timeout")]
        timeout_ms: u64,
    },
    /// Raw SCPI socket (LAN instruments, usually port 5025)
    Tcp {
        /// Host name or IP address
        host: String,
        /// TCP port
        #[serde(default = "default_scpi_port")]
        port: u16,
        /// Query timeout in milliseconds
        #[serde(default = "default_meter_timeout")]
        timeout_ms: u64,
    },
    /// VISA resource (requires the `instrument_visa` feature)
    Visa {
        /// VISA resource string (e.g., "TCPIP::192.168.7.201::INSTR")
        resource: String,
        /// Query timeout in milliseconds
        #[serde(default = "default_meter_timeout")]
        timeout_ms: u64,
    },
}

/// Result table settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Path of the semicolon-delimited result table
    pub path: PathBuf,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_nplc_max() -> u32 {
    10
}

fn default_prologix_baud() -> u32 {
    38400
}

fn default_prologix_timeout() -> u64 {
    100
}

fn default_scpi_port() -> u16 {
    5025
}

fn default_meter_timeout() -> u64 {
    5000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sweep: SweepConfig {
                max_current: 2.0,
                step_percent: 5.0,
                resolution: 0.001,
                start: SweepStart::Floor,
                test_value: 0.0085,
            },
            measurement: MeasurementConfig {
                nplc: 10,
                auto_zero: false,
                display_off: false,
                auto_range_reference: false,
                reference_function: MeasureFunction::DcCurrent,
                reference_ranges: vec![0.01, 0.1, 1.0],
                reference_max_range: 3.0,
                channels: vec![1, 11],
            },
            timing: TimingConfig {
                settle_ms: 100,
                polarity_settle_ms: 400,
                output_on_settle_ms: 1000,
            },
            source: InstrumentConfig {
                transport: TransportConfig::Prologix {
                    port: "/dev/ttyUSB0".to_string(),
                    gpib_address: 1,
                    baud_rate: default_prologix_baud(),
                    auto_read: false,
                    timeout_ms: default_prologix_timeout(),
                },
                expected_identity: "66332A".to_string(),
                nplc_max: default_nplc_max(),
            },
            reference: InstrumentConfig {
                transport: TransportConfig::Tcp {
                    host: "192.168.7.201".to_string(),
                    port: default_scpi_port(),
                    timeout_ms: default_meter_timeout(),
                },
                expected_identity: "34465A".to_string(),
                nplc_max: 100,
            },
            scanner: InstrumentConfig {
                transport: TransportConfig::Tcp {
                    host: "192.168.7.205".to_string(),
                    port: default_scpi_port(),
                    timeout_ms: default_meter_timeout(),
                },
                expected_identity: "DMM6500".to_string(),
                nplc_max: 10,
            },
            output: OutputConfig {
                path: PathBuf::from("out.csv"),
            },
        }
    }
}

impl TransportConfig {
    /// Value of the `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Prologix { .. } => "prologix",
            TransportConfig::Tcp { .. } => "tcp",
            TransportConfig::Visa { .. } => "visa",
        }
    }

    /// Human-readable address for diagnostics.
    pub fn address(&self) -> String {
        match self {
            TransportConfig::Prologix {
                port, gpib_address, ..
            } => format!("{}#{}", port, gpib_address),
            TransportConfig::Tcp { host, port, .. } => format!("{}:{}", host, port),
            TransportConfig::Visa { resource, .. } => resource.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        let ms = match self {
            TransportConfig::Prologix { timeout_ms, .. }
            | TransportConfig::Tcp { timeout_ms, .. }
            | TransportConfig::Visa { timeout_ms, .. } => *timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Same transport with its timeout raised to at least `min_ms`.
    pub fn with_min_timeout(&self, min_ms: u64) -> Self {
        let mut raised = self.clone();
        match &mut raised {
            TransportConfig::Prologix { timeout_ms, .. }
            | TransportConfig::Tcp { timeout_ms, .. }
            | TransportConfig::Visa { timeout_ms, .. } => {
                *timeout_ms = (*timeout_ms).max(min_ms);
            }
        }
        raised
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from the default file (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load settings from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(Self::figment(path.as_ref()))
    }

    /// Extract and validate; used when further providers were merged on top.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack, exposed so callers can merge further overrides.
    ///
    /// Transport tables are not merged field by field with the defaults: a
    /// default transport only fills gaps when no other `kind` was chosen, so
    /// switching kinds never inherits the other variant's fields.
    pub fn figment(path: &Path) -> Figment {
        let defaults = Settings::default();
        let mut figment = Figment::new()
            .merge(Serialized::default("log_level", &defaults.log_level))
            .merge(Serialized::default("sweep", &defaults.sweep))
            .merge(Serialized::default("measurement", &defaults.measurement))
            .merge(Serialized::default("timing", &defaults.timing))
            .merge(Serialized::default("output", &defaults.output));
        for (role, instrument) in defaults.instruments() {
            figment = figment
                .merge(Serialized::default(
                    &format!("{}.expected_identity", role),
                    &instrument.expected_identity,
                ))
                .merge(Serialized::default(
                    &format!("{}.nplc_max", role),
                    instrument.nplc_max,
                ));
        }
        figment = figment
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        for (role, instrument) in defaults.instruments() {
            let key = format!("{}.transport", role);
            let chosen = figment
                .extract_inner::<String>(&format!("{}.kind", key))
                .ok();
            if chosen.map_or(true, |kind| kind == instrument.transport.kind()) {
                figment = figment.join(Serialized::default(&key, &instrument.transport));
            }
        }
        figment
    }

    /// The three bench instruments with their config section names.
    pub fn instruments(&self) -> [(&'static str, &InstrumentConfig); 3] {
        [
            ("source", &self.source),
            ("reference", &self.reference),
            ("scanner", &self.scanner),
        ]
    }

    /// Validate values that parse but cannot drive a run.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let sweep = &self.sweep;
        if !(sweep.max_current.is_finite() && sweep.max_current > 0.0) {
            return Err(invalid(format!(
                "sweep.max_current must be positive, got {}",
                sweep.max_current
            )));
        }
        if !(sweep.step_percent.is_finite() && sweep.step_percent > 0.0) {
            return Err(invalid(format!(
                "sweep.step_percent must be positive, got {}",
                sweep.step_percent
            )));
        }
        if !(sweep.resolution.is_finite() && sweep.resolution > 0.0) {
            return Err(invalid(format!(
                "sweep.resolution must be positive, got {}",
                sweep.resolution
            )));
        }
        if sweep.resolution > sweep.max_current {
            return Err(invalid(format!(
                "sweep.resolution {} exceeds sweep.max_current {}",
                sweep.resolution, sweep.max_current
            )));
        }
        if !sweep.test_value.is_finite() || sweep.test_value.abs() > sweep.max_current {
            return Err(invalid(format!(
                "sweep.test_value {} must lie within ±{}",
                sweep.test_value, sweep.max_current
            )));
        }

        let m = &self.measurement;
        if m.nplc == 0 || m.nplc > self.reference.nplc_max {
            return Err(invalid(format!(
                "measurement.nplc must be 1..={}, got {}",
                self.reference.nplc_max, m.nplc
            )));
        }
        if self.scanner.nplc_max == 0 {
            return Err(invalid("scanner.nplc_max must be at least 1".to_string()));
        }
        if m.reference_ranges.is_empty() {
            return Err(invalid(
                "measurement.reference_ranges cannot be empty".to_string(),
            ));
        }
        if m.reference_ranges.iter().any(|r| !(r.is_finite() && *r > 0.0))
            || m.reference_ranges.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(invalid(format!(
                "measurement.reference_ranges must be positive and strictly ascending, got {:?}",
                m.reference_ranges
            )));
        }
        if let Some(last) = m.reference_ranges.last() {
            if m.reference_max_range < *last {
                return Err(invalid(format!(
                    "measurement.reference_max_range {} is below the last bucket {}",
                    m.reference_max_range, last
                )));
            }
        }

        if m.channels.is_empty() {
            return Err(invalid("measurement.channels cannot be empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for channel in &m.channels {
            if *channel == 0 {
                return Err(invalid(
                    "measurement.channels: channel 0 is the front panel, not a scanner channel"
                        .to_string(),
                ));
            }
            if !seen.insert(channel) {
                return Err(invalid(format!(
                    "measurement.channels: duplicate channel {}",
                    channel
                )));
            }
        }

        for (role, instrument) in self.instruments() {
            if instrument.expected_identity.trim().is_empty() {
                return Err(invalid(format!("{}.expected_identity cannot be empty", role)));
            }
        }

        Ok(())
    }

    /// Sweep parameters for the planner.
    pub fn sweep_plan(&self) -> SweepPlan {
        SweepPlan {
            max: self.sweep.max_current,
            step_percent: self.sweep.step_percent,
            resolution: self.sweep.resolution,
            start: self.sweep.start,
        }
    }

    /// The sweep to run: the single test value, or the full plan.
    pub fn planned_sweep(&self, test_mode: bool) -> Sweep {
        if test_mode {
            Sweep::single(self.sweep.test_value)
        } else {
            self.sweep_plan().build()
        }
    }

    /// Reference range policy derived from the measurement section.
    pub fn reference_range_policy(&self) -> RangePolicy {
        if self.measurement.auto_range_reference {
            RangePolicy::Auto
        } else {
            RangePolicy::Fixed(RangeTable::new(
                self.measurement.reference_ranges.clone(),
                self.measurement.reference_max_range,
            ))
        }
    }

    /// Transport for a meter, with the timeout raised for long integrations.
    pub fn meter_transport(&self, meter: &InstrumentConfig) -> TransportConfig {
        if self.measurement.nplc > 10 {
            meter.transport.with_min_timeout(LONG_INTEGRATION_TIMEOUT_MS)
        } else {
            meter.transport.clone()
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.timing.settle_ms)
    }

    pub fn polarity_settle(&self) -> Duration {
        Duration::from_millis(self.timing.polarity_settle_ms)
    }

    pub fn output_on_settle(&self) -> Duration {
        Duration::from_millis(self.timing.output_on_settle_ms)
    }
}

fn invalid(message: String) -> CalError {
    CalError::ConfigValidation(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.measurement.channels, vec![1, 11]);
        assert_eq!(settings.output.path, PathBuf::from("out.csv"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("does_not_exist.toml")
                .map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
                [sweep]
                max_current = 1.0
                step_percent = 10.0
                resolution = 0.0005
                start = "zero"
                test_value = 0.0085

                [measurement]
                nplc = 100
                channels = [3]

                [reference.transport]
                kind = "visa"
                resource = "TCPIP::192.168.7.201::INSTR"
                "#,
            )?;
            jail.set_env("SCAN_CAL_MEASUREMENT__AUTO_RANGE_REFERENCE", "true");
            jail.set_env("SCAN_CAL_OUTPUT__PATH", "shunts.csv");

            let settings = Settings::load_from("bench.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.sweep.max_current, 1.0);
            assert_eq!(settings.sweep.start, SweepStart::Zero);
            assert_eq!(settings.measurement.nplc, 100);
            assert_eq!(settings.measurement.channels, vec![3]);
            assert!(settings.measurement.auto_range_reference);
            assert_eq!(settings.output.path, PathBuf::from("shunts.csv"));
            assert_eq!(
                settings.reference.transport,
                TransportConfig::Visa {
                    resource: "TCPIP::192.168.7.201::INSTR".to_string(),
                    timeout_ms: 5000,
                }
            );
            // untouched sections keep their defaults
            assert_eq!(settings.scanner.expected_identity, "DMM6500");
            Ok(())
        });
    }

    #[test]
    fn test_switching_transport_kind_drops_default_fields() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
                [source.transport]
                kind = "tcp"
                host = "10.0.0.9"
                "#,
            )?;

            let settings = Settings::load_from("bench.toml").map_err(|e| e.to_string())?;
            assert_eq!(
                settings.source.transport,
                TransportConfig::Tcp {
                    host: "10.0.0.9".to_string(),
                    port: 5025,
                    timeout_ms: 5000,
                }
            );
            assert_eq!(settings.source.expected_identity, "66332A");
            assert_eq!(settings.scanner.transport, Settings::default().scanner.transport);
            Ok(())
        });
    }

    #[test]
    fn test_partial_transport_override_keeps_default_kind() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
                [scanner.transport]
                host = "192.168.7.99"
                "#,
            )?;
            jail.set_env("SCAN_CAL_SOURCE__TRANSPORT__PORT", "/dev/ttyACM0");

            let settings = Settings::load_from("bench.toml").map_err(|e| e.to_string())?;
            assert_eq!(
                settings.source.transport,
                TransportConfig::Prologix {
                    port: "/dev/ttyACM0".to_string(),
                    gpib_address: 1,
                    baud_rate: 38400,
                    auto_read: false,
                    timeout_ms: 100,
                }
            );
            assert_eq!(settings.scanner.transport.address(), "192.168.7.99:5025");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level 'loud'"));
    }

    #[test]
    fn test_resolution_above_max_rejected() {
        let mut settings = Settings::default();
        settings.sweep.resolution = 3.0;
        assert!(matches!(
            settings.validate(),
            Err(CalError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_non_ascending_ranges_rejected() {
        let mut settings = Settings::default();
        settings.measurement.reference_ranges = vec![0.1, 0.01, 1.0];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("strictly ascending"));
    }

    #[test]
    fn test_front_panel_channel_rejected() {
        let mut settings = Settings::default();
        settings.measurement.channels = vec![1, 0];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut settings = Settings::default();
        settings.measurement.channels = vec![1, 11, 1];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate channel 1"));
    }

    #[test]
    fn test_nplc_capped_by_reference() {
        let mut settings = Settings::default();
        settings.measurement.nplc = 200;
        assert!(settings.validate().is_err());
        settings.measurement.nplc = 100;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_long_integration_raises_meter_timeout() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.meter_transport(&settings.reference).timeout(),
            Duration::from_millis(5000)
        );
        settings.measurement.nplc = 100;
        assert_eq!(
            settings.meter_transport(&settings.reference).timeout(),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_range_policy_follows_auto_flag() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.reference_range_policy(),
            RangePolicy::Fixed(_)
        ));
        settings.measurement.auto_range_reference = true;
        assert_eq!(settings.reference_range_policy(), RangePolicy::Auto);
    }

    #[test]
    fn test_test_mode_sweep_is_single_value() {
        let settings = Settings::default();
        assert_eq!(settings.planned_sweep(true).values(), &[0.0085]);
        assert!(settings.planned_sweep(false).len() > 100);
    }

    #[test]
    fn test_transport_address() {
        let settings = Settings::default();
        assert_eq!(settings.source.transport.address(), "/dev/ttyUSB0#1");
        assert_eq!(settings.reference.transport.address(), "192.168.7.201:5025");
    }
}
