use super::mapping::compute_domain;
use super::GazeSample;
use crate::error::{Error, Result};
use crate::util::mean;
use serde::{Deserialize, Serialize};

pub const MIN_CALIBRATION_SAMPLES: usize = 20;
pub const MIN_AVERAGE_CONFIDENCE: f64 = 0.30;
pub const MIN_MOVEMENT_PX: f64 = 50.0;
pub const MIN_COVERAGE_PX: f64 = 100.0;
pub const GOOD_LIGHTING_CONFIDENCE: f64 = 0.60;
pub const LOW_CONFIDENCE: f64 = 0.30;
pub const EYEGLASSES_LOW_CONFIDENCE_RATIO: f64 = 0.60;
pub const MIN_POSITIONING_SAMPLES: usize = 5;

pub const MIN_SAMPLE_CONFIDENCE: f64 = 0.10;
pub const MIN_VALID_GAZE_POINTS: usize = 10;
pub const MAX_DROPPED_RATIO: f64 = 0.90;
pub const MIN_GAZE_SPREAD_PX: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LightingQuality {
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CameraPositioning {
    Optimal,
    Suboptimal,
}

/// Verdict on one calibration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub is_valid: bool,
    pub points_collected: usize,
    pub average_confidence: f64,
    pub lighting_quality: LightingQuality,
    pub eyeglasses_detected: bool,
    pub camera_positioning: CameraPositioning,
    pub error_message: Option<String>,
}

impl CalibrationResult {
    /// `CalibrationInvalid` carrying the failure reasons when not valid.
    pub fn ensure_valid(&self) -> Result<&Self> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(Error::CalibrationInvalid(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "calibration failed".to_string()),
            ))
        }
    }
}

pub fn validate_calibration(samples: &[GazeSample]) -> CalibrationResult {
    let confidences: Vec<f64> = samples.iter().map(|s| s.confidence).collect();
    let average_confidence = mean(&confidences).unwrap_or(0.0);

    let moved = samples.first().is_some_and(|first| {
        samples.iter().any(|s| {
            (s.x - first.x).abs() > MIN_MOVEMENT_PX || (s.y - first.y).abs() > MIN_MOVEMENT_PX
        })
    });
    let covered = compute_domain(samples)
        .is_some_and(|d| d.width() > MIN_COVERAGE_PX && d.height() > MIN_COVERAGE_PX);

    let mut problems = Vec::new();
    if samples.len() < MIN_CALIBRATION_SAMPLES {
        problems.push(format!(
            "Insufficient calibration points: {} collected, {} required",
            samples.len(),
            MIN_CALIBRATION_SAMPLES
        ));
    }
    if average_confidence <= MIN_AVERAGE_CONFIDENCE {
        problems.push(format!(
            "Low average confidence ({:.2}); improve lighting and face the camera",
            average_confidence
        ));
    }
    if !moved {
        problems.push("No eye movement detected; follow each target with your eyes".to_string());
    }
    if !covered {
        problems.push("Calibration did not cover enough of the screen".to_string());
    }

    let lighting_quality = if average_confidence >= GOOD_LIGHTING_CONFIDENCE {
        LightingQuality::Good
    } else if average_confidence >= LOW_CONFIDENCE {
        LightingQuality::Fair
    } else {
        LightingQuality::Poor
    };

    let low = confidences.iter().filter(|c| **c < LOW_CONFIDENCE).count();
    let eyeglasses_detected =
        !samples.is_empty() && low as f64 / samples.len() as f64 > EYEGLASSES_LOW_CONFIDENCE_RATIO;

    let camera_positioning = if samples.len() >= MIN_POSITIONING_SAMPLES && covered {
        CameraPositioning::Optimal
    } else {
        CameraPositioning::Suboptimal
    };

    CalibrationResult {
        is_valid: problems.is_empty(),
        points_collected: samples.len(),
        average_confidence,
        lighting_quality,
        eyeglasses_detected,
        camera_positioning,
        error_message: if problems.is_empty() {
            None
        } else {
            Some(problems.join("; "))
        },
    }
}

/// Outcome of screening a finished tracking session
#[derive(Debug, Clone, PartialEq)]
pub struct GazeDataValidation {
    pub is_valid: bool,
    pub valid_samples: Vec<GazeSample>,
    pub issues: Vec<String>,
}

pub fn validate_gaze_data(samples: &[GazeSample]) -> GazeDataValidation {
    let valid_samples: Vec<GazeSample> = samples
        .iter()
        .filter(|s| s.confidence >= MIN_SAMPLE_CONFIDENCE)
        .copied()
        .collect();

    let mut issues = Vec::new();
    if valid_samples.len() < MIN_VALID_GAZE_POINTS {
        issues.push(format!(
            "Too few valid points: {} of {} samples passed the confidence filter",
            valid_samples.len(),
            samples.len()
        ));
    }

    let dropped = samples.len() - valid_samples.len();
    if !samples.is_empty() && dropped as f64 / samples.len() as f64 > MAX_DROPPED_RATIO {
        issues.push(format!(
            "High percentage of low-confidence points: {:.0}% dropped",
            dropped as f64 / samples.len() as f64 * 100.0
        ));
    }

    if let Some(d) = compute_domain(&valid_samples) {
        if d.width() < MIN_GAZE_SPREAD_PX || d.height() < MIN_GAZE_SPREAD_PX {
            issues.push(format!(
                "Insufficient gaze movement: spread {:.0}x{:.0}px",
                d.width(),
                d.height()
            ));
        }
    }

    GazeDataValidation {
        is_valid: issues.is_empty(),
        valid_samples,
        issues,
    }
}
