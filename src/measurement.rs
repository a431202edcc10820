//! Measurement requests and results.
//!
//! A [`MeasurementSpec`] is built fresh for every sample: range and channel
//! state live on the instrument, so a spec is never reused. A
//! [`MeasurementResult`] either carries a value or a [`Rejection`], never both;
//! a rejected reading cannot leak a number into the result table.

use crate::error::Rejection;
use std::fmt;

/// Front-panel input of the scanner meter.
pub const FRONT_PANEL: u16 = 0;

/// Range requested for one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeRequest {
    /// Let the instrument pick (probe measurements only)
    Auto,
    /// Fixed full-scale range
    Fixed(f64),
}

impl RangeRequest {
    pub fn is_auto(&self) -> bool {
        matches!(self, RangeRequest::Auto)
    }
}

impl fmt::Display for RangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeRequest::Auto => write!(f, "AUTO"),
            RangeRequest::Fixed(range) => write!(f, "{}", range),
        }
    }
}

/// What to measure on the scanner meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementSpec {
    /// Scanner channel, or [`FRONT_PANEL`]
    pub channel: u16,
    pub range: RangeRequest,
}

impl MeasurementSpec {
    pub fn new(channel: u16, range: RangeRequest) -> Self {
        Self { channel, range }
    }

    pub fn front_panel(range: RangeRequest) -> Self {
        Self::new(FRONT_PANEL, range)
    }

    pub fn is_front_panel(&self) -> bool {
        self.channel == FRONT_PANEL
    }
}

/// Condensed status of a result, as reported in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementStatus {
    Ok,
    ChannelMismatch,
    StatusMismatch,
    Malformed,
}

/// Outcome of one fetched reading.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementResult {
    /// Reading accepted
    Valid { value: f64, range: f64 },
    /// Reading discarded; the range the instrument reported is still kept
    Rejected { rejection: Rejection, range: f64 },
}

impl MeasurementResult {
    pub fn value(&self) -> Option<f64> {
        match self {
            MeasurementResult::Valid { value, .. } => Some(*value),
            MeasurementResult::Rejected { .. } => None,
        }
    }

    pub fn range(&self) -> f64 {
        match self {
            MeasurementResult::Valid { range, .. } | MeasurementResult::Rejected { range, .. } => {
                *range
            }
        }
    }

    pub fn status(&self) -> MeasurementStatus {
        match self {
            MeasurementResult::Valid { .. } => MeasurementStatus::Ok,
            MeasurementResult::Rejected { rejection, .. } => match rejection {
                Rejection::ChannelMismatch { .. } => MeasurementStatus::ChannelMismatch,
                Rejection::StatusMismatch(_) => MeasurementStatus::StatusMismatch,
                Rejection::MalformedReply(_) => MeasurementStatus::Malformed,
            },
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            MeasurementResult::Valid { .. } => None,
            MeasurementResult::Rejected { rejection, .. } => Some(rejection),
        }
    }
}
