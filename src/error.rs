//! Custom error types for the calibration bench.
//!
//! `CalError` is the single error type returned by the library. It splits
//! failures into the categories the runner treats differently:
//!
//! - **`Connection`**: a transport could not be opened (port busy, host down).
//! - **`IdentityMismatch`**: an instrument answered `*IDN?` with an unexpected
//!   model string. Fatal before any measurement.
//! - **`Configuration`**: an instrument reported a non-empty error queue after
//!   a setup command. Fatal; the runner still restores the idle state.
//! - **`Protocol`**: no reply, a garbled reply, or a reply that cannot be
//!   parsed where a number is mandatory. Fatal for the call.
//! - **`Config`** / **`ConfigValidation`**: problems with the settings file or
//!   with values that parse but make no sense.
//! - **`FeatureNotEnabled`**: a transport kind was requested that was not
//!   compiled in.
//!
//! Per-sample validation failures of the scanner are *not* errors; they are
//! described by [`Rejection`] and travel inside a
//! [`MeasurementResult`](crate::measurement::MeasurementResult).

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, CalError>;

#[derive(Error, Debug)]
pub enum CalError {
    #[error("Failed to open {instrument} at '{address}': {reason}")]
    Connection {
        instrument: String,
        address: String,
        reason: String,
    },

    #[error("{instrument}: unexpected identity \"{reported}\" (expected model {expected})")]
    IdentityMismatch {
        instrument: String,
        expected: String,
        reported: String,
    },

    #[error("{instrument}: error during {stage}: \"{status}\"")]
    Configuration {
        instrument: String,
        stage: String,
        status: String,
    },

    #[error("{instrument}: protocol error on '{command}': {reason}")]
    Protocol {
        instrument: String,
        command: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Result table error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl CalError {
    /// Instrument the error is attributed to, if any.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            CalError::Connection { instrument, .. }
            | CalError::IdentityMismatch { instrument, .. }
            | CalError::Configuration { instrument, .. }
            | CalError::Protocol { instrument, .. } => Some(instrument),
            _ => None,
        }
    }
}

/// Why a single scanner reading was discarded.
///
/// A rejected reading is recorded as an empty field in the row; the run goes on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("reply from channel {reported}, requested channel {requested}")]
    ChannelMismatch { requested: u16, reported: String },

    #[error("status code {0} is not accepted")]
    StatusMismatch(String),

    #[error("malformed reply \"{0}\"")]
    MalformedReply(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CalError::IdentityMismatch {
            instrument: "reference".into(),
            expected: "34465A".into(),
            reported: "Keysight,34470A,MY1,1.0".into(),
        };
        assert_eq!(
            err.to_string(),
            "reference: unexpected identity \"Keysight,34470A,MY1,1.0\" (expected model 34465A)"
        );
        assert_eq!(err.instrument(), Some("reference"));
    }

    #[test]
    fn test_rejection_display() {
        let rejection = Rejection::ChannelMismatch {
            requested: 11,
            reported: "1".into(),
        };
        assert_eq!(
            rejection.to_string(),
            "reply from channel 1, requested channel 11"
        );
    }

    #[test]
    fn test_feature_not_enabled() {
        let err = CalError::FeatureNotEnabled("instrument_visa".into());
        assert!(err.to_string().contains("--features instrument_visa"));
        assert_eq!(err.instrument(), None);
    }
}
