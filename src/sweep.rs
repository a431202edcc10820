//! Stimulus sweep planning.
//!
//! Magnitudes grow by a percentage of themselves, but never by less than the
//! resolution floor. That gives fine, evenly spaced steps near zero and
//! near-logarithmic spacing towards the maximum. Every magnitude is visited
//! with both signs and the extremes are always included.

use serde::{Deserialize, Serialize};

/// Relative slack on the last-step gap, absorbing accumulated rounding.
const GAP_TOLERANCE: f64 = 1e-9;

/// First magnitude of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepStart {
    /// Start at the resolution floor; zero itself is not visited
    #[default]
    Floor,
    /// Start at zero; zero is visited exactly once
    Zero,
}

/// Parameters of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    /// Largest magnitude (amps)
    pub max: f64,
    /// Growth per step in percent
    pub step_percent: f64,
    /// Smallest step (amps)
    pub resolution: f64,
    pub start: SweepStart,
}

impl SweepPlan {
    /// Build the sweep. Pure function of the plan.
    pub fn build(&self) -> Sweep {
        let mut values = Vec::new();
        let mut magnitude = match self.start {
            SweepStart::Floor => self.resolution,
            SweepStart::Zero => 0.0,
        };

        while magnitude < self.max {
            // keep the gap to the explicit extremes at least one floor step wide
            if self.max - magnitude >= self.resolution * (1.0 - GAP_TOLERANCE) {
                if magnitude == 0.0 {
                    values.push(0.0);
                } else {
                    values.push(magnitude);
                    values.push(-magnitude);
                }
            }
            let step = (magnitude * self.step_percent / 100.0).max(self.resolution);
            magnitude += step;
        }

        values.push(self.max);
        values.push(-self.max);
        values.sort_by(|a, b| a.total_cmp(b));
        Sweep { values }
    }
}

/// Ordered stimulus values, ascending. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
    values: Vec<f64>,
}

impl Sweep {
    /// A sweep of exactly one value (test mode).
    pub fn single(value: f64) -> Self {
        Self {
            values: vec![value],
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn bench_plan() -> SweepPlan {
        SweepPlan {
            max: 2.0,
            step_percent: 5.0,
            resolution: 0.001,
            start: SweepStart::Floor,
        }
    }

    #[test]
    fn test_floor_steps_near_zero() {
        let sweep = bench_plan().build();
        let positive: Vec<f64> = sweep.iter().filter(|v| *v > 0.0).collect();
        for (i, expected) in [0.001, 0.002, 0.003, 0.004, 0.005].iter().enumerate() {
            assert!(
                (positive[i] - expected).abs() < EPS,
                "value {} was {}",
                i,
                positive[i]
            );
        }
    }

    #[test]
    fn test_growth_becomes_multiplicative() {
        let sweep = bench_plan().build();
        let positive: Vec<f64> = sweep.iter().filter(|v| *v > 0.0).collect();
        // below 0.02 the floor dominates, above it the 5% step does
        let fine = positive
            .windows(2)
            .find(|w| w[0] > 0.05)
            .map(|w| w[1] / w[0])
            .unwrap();
        assert!((fine - 1.05).abs() < 1e-9);
        let floor_gap = positive[10] - positive[9];
        assert!((floor_gap - 0.001).abs() < EPS);
    }

    #[test]
    fn test_extremes_present_and_sorted() {
        let sweep = bench_plan().build();
        let values = sweep.values();
        assert_eq!(values.first(), Some(&-2.0));
        assert_eq!(values.last(), Some(&2.0));
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_no_gap_below_resolution() {
        for plan in [
            bench_plan(),
            SweepPlan {
                max: 1.0,
                step_percent: 7.5,
                resolution: 0.0005,
                start: SweepStart::Floor,
            },
            SweepPlan {
                max: 0.0105,
                step_percent: 5.0,
                resolution: 0.001,
                start: SweepStart::Zero,
            },
        ] {
            let sweep = plan.build();
            for w in sweep.values().windows(2) {
                assert!(
                    w[1] - w[0] >= plan.resolution - EPS,
                    "gap {} between {} and {}",
                    w[1] - w[0],
                    w[0],
                    w[1]
                );
            }
        }
    }

    #[test]
    fn test_last_floor_step_survives_rounding_drift() {
        let plan = SweepPlan {
            max: 0.02,
            ..bench_plan()
        };
        let positive: Vec<f64> = plan.build().iter().filter(|v| *v > 0.0).collect();
        // 0.001 ..= 0.019 in floor steps, then the maximum
        assert_eq!(positive.len(), 20);
        assert!((positive[18] - 0.019).abs() < EPS);
        assert_eq!(positive[19], 0.02);
        for w in positive.windows(2) {
            assert!((w[1] - w[0] - 0.001).abs() < EPS, "{:?}", w);
        }
    }

    #[test]
    fn test_symmetric() {
        let sweep = bench_plan().build();
        let values = sweep.values();
        let n = values.len();
        assert_eq!(n % 2, 0);
        for i in 0..n {
            assert_eq!(values[i], -values[n - 1 - i]);
        }
    }

    #[test]
    fn test_zero_start_visits_zero_once() {
        let plan = SweepPlan {
            start: SweepStart::Zero,
            ..bench_plan()
        };
        let sweep = plan.build();
        assert_eq!(sweep.iter().filter(|v| *v == 0.0).count(), 1);
        assert!(sweep.values().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sweep.len(), bench_plan().build().len() + 1);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(bench_plan().build(), bench_plan().build());
    }

    #[test]
    fn test_single_value_sweep() {
        let sweep = Sweep::single(0.0085);
        assert_eq!(sweep.values(), &[0.0085]);
        assert!(!sweep.is_empty());
    }
}
