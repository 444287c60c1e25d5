//! Calibration result messages.
//!
//! After a calibration command the QZFM prints one message with a figure per
//! axis, e.g. `Calib X:1.02, Y:0.98, Z:1.10`. Lower is better; the device
//! cannot report figures above 15.9.

use serde::Serialize;

/// Reporting ceiling of the device.
pub const CALIBRATION_FIGURE_CEILING: f64 = 15.9;
/// Figures strictly below this are a good calibration.
pub const CALIBRATION_OK_LIMIT: f64 = 1.5;

/// A parsed calibration result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    /// `(label, figure)` per field of the message, figures clamped.
    pub axes: Vec<(String, f64)>,
    /// Worst (largest) clamped figure.
    pub figure: f64,
    /// Message text as received.
    pub message: String,
}

impl CalibrationReport {
    /// Parse a message, returning `None` if it is not a calibration result.
    pub fn parse(message: &str) -> Option<Self> {
        if !message.to_lowercase().contains("calib") {
            return None;
        }

        let axes: Vec<(String, f64)> = message
            .split(',')
            .filter_map(|field| {
                let split = field.rfind(|c: char| c == ':' || c == ')')?;
                let value: f64 = field[split + 1..].trim().parse().ok()?;
                let label = field[..split]
                    .trim()
                    .trim_start_matches('(')
                    .rsplit(|c: char| c == ' ' || c == '(')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                Some((label, clamp_figure(value)))
            })
            .collect();

        let figure = axes
            .iter()
            .map(|(_, v)| *v)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))?;

        Some(Self {
            axes,
            figure,
            message: message.to_string(),
        })
    }

    pub fn is_ok(&self) -> bool {
        calibration_ok(self.figure)
    }
}

/// Clamp a figure at the reporting ceiling.
pub fn clamp_figure(figure: f64) -> f64 {
    if figure >= CALIBRATION_FIGURE_CEILING {
        CALIBRATION_FIGURE_CEILING
    } else {
        figure
    }
}

/// Whether a figure counts as a good calibration. A poor figure is not an error.
pub fn calibration_ok(figure: f64) -> bool {
    clamp_figure(figure) < CALIBRATION_OK_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_at_ceiling() {
        assert_eq!(clamp_figure(15.9), 15.9);
        assert_eq!(clamp_figure(99.0), 15.9);
        assert_eq!(clamp_figure(3.2), 3.2);
    }

    #[test]
    fn ok_threshold() {
        assert!(calibration_ok(1.4));
        assert!(!calibration_ok(1.6));
        assert!(!calibration_ok(1.5));
    }

    #[test]
    fn parses_per_axis_figures() {
        let report = CalibrationReport::parse("Calib X:1.02, Y:0.98, Z:1.10").unwrap();
        assert_eq!(report.axes.len(), 3);
        assert_eq!(report.axes[0], ("X".to_string(), 1.02));
        assert_eq!(report.axes[2], ("Z".to_string(), 1.10));
        assert_eq!(report.figure, 1.10);
        assert!(report.is_ok());
    }

    #[test]
    fn degraded_and_saturated_figures() {
        let report = CalibrationReport::parse("Calibration: 1.6").unwrap();
        assert_eq!(report.figure, 1.6);
        assert!(!report.is_ok());

        let report = CalibrationReport::parse("Calib X:22.0, Y:1.0").unwrap();
        assert_eq!(report.figure, 15.9);
        assert_eq!(report.axes[0].1, 15.9);
    }

    #[test]
    fn ignores_other_messages() {
        assert!(CalibrationReport::parse("Laser locked").is_none());
        assert!(CalibrationReport::parse("Calibrating...").is_none());
    }
}
