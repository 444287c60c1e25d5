//! Field zeroing convergence.
//!
//! While zeroing, the coil offsets are sampled once per cycle. Each cycle
//! yields the change since the previous reading per axis (and of the cell
//! temperature error). Zeroing has converged when every enabled threshold is
//! met by the latest change. A threshold is disabled by making it infinite.

use serde::{Deserialize, Serialize};

use crate::codec::{ReadAxis, ZeroingAxes};

/// Per-quantity step limits, pT for fields. Non-finite values are disabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZeroingThresholds {
    pub d_bx: f64,
    pub d_by: f64,
    pub d_bz: f64,
    pub d_temp: f64,
}

impl Default for ZeroingThresholds {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ZeroingThresholds {
    pub const fn disabled() -> Self {
        Self {
            d_bx: f64::INFINITY,
            d_by: f64::INFINITY,
            d_bz: f64::INFINITY,
            d_temp: f64::INFINITY,
        }
    }

    pub fn with_bx(mut self, limit: f64) -> Self {
        self.d_bx = limit;
        self
    }

    pub fn with_by(mut self, limit: f64) -> Self {
        self.d_by = limit;
        self
    }

    pub fn with_bz(mut self, limit: f64) -> Self {
        self.d_bz = limit;
        self
    }

    pub fn with_temp(mut self, limit: f64) -> Self {
        self.d_temp = limit;
        self
    }

    fn field(&self, axis: ReadAxis) -> f64 {
        match axis {
            ReadAxis::X => self.d_bx,
            ReadAxis::Y => self.d_by,
            ReadAxis::Z => self.d_bz,
        }
    }

    /// True if at least one threshold applies to the given axis set.
    pub fn any_enabled(&self, axes: ZeroingAxes) -> bool {
        self.d_temp.is_finite()
            || [ReadAxis::X, ReadAxis::Y, ReadAxis::Z]
                .into_iter()
                .any(|a| axes.includes(a) && self.field(a).is_finite())
    }

    /// Every enabled threshold is met by `obs`. The conditions are ANDed.
    pub fn is_satisfied(&self, obs: &ZeroingObservation, axes: ZeroingAxes) -> bool {
        let fields_ok = [ReadAxis::X, ReadAxis::Y, ReadAxis::Z]
            .into_iter()
            .filter(|&a| axes.includes(a) && self.field(a).is_finite())
            .all(|a| obs.field_delta(a) <= self.field(a));
        let temp_ok = !self.d_temp.is_finite() || obs.d_temp <= self.d_temp;
        fields_ok && temp_ok
    }

    /// Index of the first observation that satisfies every enabled threshold.
    pub fn first_converged(
        &self,
        observations: &[ZeroingObservation],
        axes: ZeroingAxes,
    ) -> Option<usize> {
        observations.iter().position(|o| self.is_satisfied(o, axes))
    }
}

/// One offset reading: coil fields `[x, y, z]` in pT and the cell temperature error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZeroingReading {
    pub field: [f64; 3],
    pub cell_temp_error: Option<f64>,
}

/// Absolute change between two consecutive readings. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZeroingObservation {
    pub d_bx: f64,
    pub d_by: f64,
    pub d_bz: f64,
    /// Infinite when either reading lacks a temperature.
    pub d_temp: f64,
}

impl ZeroingObservation {
    pub fn field_delta(&self, axis: ReadAxis) -> f64 {
        match axis {
            ReadAxis::X => self.d_bx,
            ReadAxis::Y => self.d_by,
            ReadAxis::Z => self.d_bz,
        }
    }

    fn between(prev: &ZeroingReading, next: &ZeroingReading) -> Self {
        let d = |i: usize| (next.field[i] - prev.field[i]).abs();
        let d_temp = match (prev.cell_temp_error, next.cell_temp_error) {
            (Some(a), Some(b)) => (b - a).abs(),
            _ => f64::INFINITY,
        };
        Self {
            d_bx: d(0),
            d_by: d(1),
            d_bz: d(2),
            d_temp,
        }
    }
}

/// Keeps the previous reading and turns each new one into an observation.
#[derive(Debug, Clone, Default)]
pub struct ZeroingTracker {
    last: Option<ZeroingReading>,
}

impl ZeroingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading. The first one only sets the baseline.
    pub fn observe(&mut self, reading: ZeroingReading) -> Option<ZeroingObservation> {
        let obs = self
            .last
            .as_ref()
            .map(|prev| ZeroingObservation::between(prev, &reading));
        self.last = Some(reading);
        obs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn z_step(d: f64) -> ZeroingObservation {
        ZeroingObservation {
            d_bx: 1000.0,
            d_by: 1000.0,
            d_bz: d,
            d_temp: f64::INFINITY,
        }
    }

    #[test]
    fn z_threshold_stops_on_first_small_step() {
        let thresholds = ZeroingThresholds::disabled().with_bz(5.0);
        let obs: Vec<_> = [50.0, 20.0, 8.0, 4.0].into_iter().map(z_step).collect();
        assert_eq!(thresholds.first_converged(&obs, ZeroingAxes::All), Some(3));
    }

    #[test]
    fn thresholds_are_anded() {
        let thresholds = ZeroingThresholds::disabled().with_bz(5.0).with_by(5.0);
        let obs = ZeroingObservation {
            d_bx: 0.0,
            d_by: 6.0,
            d_bz: 1.0,
            d_temp: 0.0,
        };
        assert!(!thresholds.is_satisfied(&obs, ZeroingAxes::All));
    }

    #[test]
    fn x_threshold_ignored_for_yz_zeroing() {
        let thresholds = ZeroingThresholds::disabled().with_bx(1.0).with_bz(5.0);
        let obs = ZeroingObservation {
            d_bx: 100.0,
            d_by: 100.0,
            d_bz: 2.0,
            d_temp: f64::INFINITY,
        };
        assert!(!thresholds.is_satisfied(&obs, ZeroingAxes::All));
        assert!(thresholds.is_satisfied(&obs, ZeroingAxes::YZ));
        assert!(!ZeroingThresholds::disabled()
            .with_bx(1.0)
            .any_enabled(ZeroingAxes::YZ));
    }

    #[test]
    fn nan_step_never_satisfies() {
        let thresholds = ZeroingThresholds::disabled().with_bz(5.0);
        assert!(!thresholds.is_satisfied(&z_step(f64::NAN), ZeroingAxes::All));
    }

    #[test]
    fn disabling_a_threshold_never_delays_convergence() {
        let obs: Vec<ZeroingObservation> = [
            (9.0, 3.0, 0.5),
            (4.0, 7.0, 0.2),
            (2.0, 6.0, 0.3),
            (1.0, 2.0, 0.05),
            (0.5, 1.0, 0.01),
        ]
        .into_iter()
        .map(|(y, z, t)| ZeroingObservation {
            d_bx: 0.0,
            d_by: y,
            d_bz: z,
            d_temp: t,
        })
        .collect();

        let full = ZeroingThresholds::disabled()
            .with_by(2.5)
            .with_bz(2.5)
            .with_temp(0.1);
        let relaxed = [
            full.with_by(f64::INFINITY),
            full.with_bz(f64::INFINITY),
            full.with_temp(f64::INFINITY),
            ZeroingThresholds::disabled().with_bz(2.5),
        ];

        let baseline = full.first_converged(&obs, ZeroingAxes::All).unwrap();
        assert_eq!(baseline, 3);
        for t in relaxed {
            let at = t.first_converged(&obs, ZeroingAxes::All).unwrap();
            assert!(at <= baseline, "{t:?} converged at {at}, later than {baseline}");
        }
    }

    #[test]
    fn tracker_reports_deltas_after_baseline() {
        let mut tracker = ZeroingTracker::new();
        let reading = |z: f64, t: Option<f64>| ZeroingReading {
            field: [0.0, 0.0, z],
            cell_temp_error: t,
        };
        assert!(tracker.observe(reading(0.0, Some(0.1))).is_none());
        let obs = tracker.observe(reading(-50.0, Some(0.3))).unwrap();
        assert_eq!(obs.d_bz, 50.0);
        assert!((obs.d_temp - 0.2).abs() < 1e-12);
        let obs = tracker.observe(reading(-40.0, None)).unwrap();
        assert_eq!(obs.d_bz, 10.0);
        assert!(obs.d_temp.is_infinite());
    }
}
