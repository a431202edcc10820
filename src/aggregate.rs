//! Turning the samples of one stimulus level into a result row.

use crate::range::reconcile;
use crate::sampler::SyncSample;

/// Per-channel columns of a row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelColumns {
    pub channel: u16,
    /// Reference reading taken together with this channel
    pub actual: Option<f64>,
    /// Scanner reading of this channel
    pub reading: Option<f64>,
    /// `actual / reading`
    pub factor: Option<f64>,
}

/// One persisted calibration record.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    /// Position in the sweep
    pub index: usize,
    /// Commanded stimulus
    pub set: f64,
    pub channels: Vec<ChannelColumns>,
    /// Mean of the per-channel reference readings; empty if any is missing
    pub avg_actual: Option<f64>,
    pub abs_actual: Option<f64>,
    /// Reconciled scanner range
    pub target_range: Option<f64>,
    /// Reconciled reference range
    pub reference_range: Option<f64>,
}

/// Scale factor, or nothing when either side is missing or the reading is
/// zero.
pub fn scale_factor(actual: Option<f64>, reading: Option<f64>) -> Option<f64> {
    match (actual, reading) {
        (Some(actual), Some(reading)) if reading != 0.0 => Some(actual / reading),
        _ => None,
    }
}

pub fn aggregate(index: usize, set: f64, samples: &[SyncSample]) -> SampleRow {
    let channels: Vec<ChannelColumns> = samples
        .iter()
        .map(|sample| {
            let actual = sample.reference.value();
            let reading = sample.target.value();
            ChannelColumns {
                channel: sample.channel,
                actual,
                reading,
                factor: scale_factor(actual, reading),
            }
        })
        .collect();

    let actuals: Option<Vec<f64>> = channels.iter().map(|c| c.actual).collect();
    let avg_actual = actuals
        .filter(|values| !values.is_empty())
        .map(|values| values.iter().sum::<f64>() / values.len() as f64);

    let reference_ranges: Vec<f64> = samples.iter().map(|s| s.reference.range()).collect();
    let target_ranges: Vec<f64> = samples.iter().map(|s| s.target.range()).collect();

    SampleRow {
        index,
        set,
        channels,
        avg_actual,
        abs_actual: avg_actual.map(f64::abs),
        target_range: reconcile(&target_ranges),
        reference_range: reconcile(&reference_ranges),
    }
}
