//! Range coordination between the reference meter and the scanner.
//!
//! Fixed ranges keep readings on both instruments comparable and stop an
//! autorange cycle from landing in the middle of a synchronized sample.

use crate::measurement::RangeRequest;

/// Magnitude buckets mapped onto discrete range codes.
///
/// A magnitude maps to the first bucket threshold it does not exceed (the
/// boundary belongs to the lower bucket); anything above the last threshold
/// maps to `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeTable {
    steps: Vec<f64>,
    max: f64,
}

impl RangeTable {
    /// `steps` must be ascending; see [`Settings::validate`](crate::config::Settings::validate).
    pub fn new(steps: Vec<f64>, max: f64) -> Self {
        Self { steps, max }
    }

    pub fn select(&self, magnitude: f64) -> f64 {
        let magnitude = magnitude.abs();
        self.steps
            .iter()
            .copied()
            .find(|step| magnitude <= *step)
            .unwrap_or(self.max)
    }
}

impl Default for RangeTable {
    fn default() -> Self {
        Self::new(vec![0.01, 0.1, 1.0], 3.0)
    }
}

/// How the reference range is chosen for a stimulus level.
#[derive(Debug, Clone, PartialEq)]
pub enum RangePolicy {
    /// Probe in autorange at every level and reuse what the meter picked
    Auto,
    /// Bucket the stimulus magnitude
    Fixed(RangeTable),
}

impl RangePolicy {
    pub fn request_for(&self, stimulus: f64) -> RangeRequest {
        match self {
            RangePolicy::Auto => RangeRequest::Auto,
            RangePolicy::Fixed(table) => RangeRequest::Fixed(table.select(stimulus)),
        }
    }
}

/// Representative range for several reported ranges: their arithmetic mean.
///
/// Returns `None` when nothing was reported.
pub fn reconcile(ranges: &[f64]) -> Option<f64> {
    if ranges.is_empty() {
        return None;
    }
    Some(ranges.iter().sum::<f64>() / ranges.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries_are_inclusive() {
        let table = RangeTable::default();
        assert_eq!(table.select(0.0), 0.01);
        assert_eq!(table.select(0.01), 0.01);
        assert_eq!(table.select(0.0100001), 0.1);
        assert_eq!(table.select(0.1), 0.1);
        assert_eq!(table.select(0.5), 1.0);
        assert_eq!(table.select(1.0), 1.0);
        assert_eq!(table.select(1.5), 3.0);
        assert_eq!(table.select(2.0), 3.0);
    }

    #[test]
    fn test_sign_is_ignored() {
        let table = RangeTable::default();
        assert_eq!(table.select(-0.0085), 0.01);
        assert_eq!(table.select(-2.0), 3.0);
    }

    #[test]
    fn test_selection_is_repeatable() {
        let table = RangeTable::default();
        let first = table.select(0.042);
        let second = table.select(0.042);
        assert_eq!(first, second);
    }

    #[test]
    fn test_policy_requests() {
        assert_eq!(RangePolicy::Auto.request_for(0.5), RangeRequest::Auto);
        assert_eq!(
            RangePolicy::Fixed(RangeTable::default()).request_for(0.5),
            RangeRequest::Fixed(1.0)
        );
    }

    #[test]
    fn test_reconcile_mean() {
        assert_eq!(reconcile(&[0.1, 0.3]), Some(0.2));
        assert_eq!(reconcile(&[10.0, 10.0]), Some(10.0));
        assert_eq!(reconcile(&[]), None);
    }
}
