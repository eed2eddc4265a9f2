//! Sweep settings for a measurement run.

use crate::error::{ValidationError, ValidationErrors};
use serde::{Deserialize, Serialize};

/// Sweep point counts the analyzers accept.
pub const FREQUENCY_POINT_CHOICES: [u32; 4] = [201, 401, 801, 1001];

/// Largest repeat count a single run may request.
pub const MAX_MEASUREMENT_COUNT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub measurement_count: u32,
    pub frequency_points: u32,
    pub start_frequency_mhz: f64,
    pub stop_frequency_mhz: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            measurement_count: 50,
            frequency_points: 201,
            start_frequency_mhz: 500.0,
            stop_frequency_mhz: 2500.0,
        }
    }
}

impl MeasurementConfig {
    /// Check every rule and report all violations together.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if !(1..=MAX_MEASUREMENT_COUNT).contains(&self.measurement_count) {
            errors.push(ValidationError::OutOfRange {
                field: "measurement_count",
                value: self.measurement_count.to_string(),
                allowed: format!("1..={MAX_MEASUREMENT_COUNT}"),
            });
        }
        if !FREQUENCY_POINT_CHOICES.contains(&self.frequency_points) {
            errors.push(ValidationError::OutOfRange {
                field: "frequency_points",
                value: self.frequency_points.to_string(),
                allowed: "201, 401, 801 or 1001".to_string(),
            });
        }
        // Negated so NaN fails too.
        if !(self.start_frequency_mhz > 0.0) {
            errors.push(ValidationError::OutOfRange {
                field: "start_frequency_mhz",
                value: self.start_frequency_mhz.to_string(),
                allowed: "> 0".to_string(),
            });
        }
        if !(self.start_frequency_mhz < self.stop_frequency_mhz) {
            errors.push(ValidationError::InvertedSweep {
                start: self.start_frequency_mhz,
                stop: self.stop_frequency_mhz,
            });
        }

        errors.into_result()
    }
}
