use crate::error::Result;
use crate::gaze::fixation::FixationPoint;
use crate::gaze::{CalibrationResult, GazeSample, Point};
use crate::util::{mean, std_dev};
use serde::{Deserialize, Serialize};

/// Everything kept about one gaze-tracking experiment run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GazeSessionRecord {
    pub gaze_points: Vec<GazeSample>,
    pub fixation_points: Option<Vec<FixationPoint>>,
    pub scan_path: Option<Vec<Point>>,
    /// Milliseconds between first and last sample
    pub session_duration: Option<i64>,
    pub calibration_data: Option<CalibrationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl GazeSessionRecord {
    pub fn confidence_stats(&self) -> Option<ConfidenceStats> {
        let confidences: Vec<f64> = self.gaze_points.iter().map(|s| s.confidence).collect();
        Some(ConfidenceStats {
            mean: mean(&confidences)?,
            std_dev: std_dev(&confidences)?,
        })
    }

    pub fn fixation_count(&self) -> usize {
        self.fixation_points.as_ref().map_or(0, Vec::len)
    }
}

/// Durable sink for finished gaze sessions
pub trait GazeSessionStore {
    /// Attach `record` to an experiment. Unknown experiments are
    /// `Error::NotFound`. Returns the stored session's id.
    fn save_gaze_session(&self, experiment_id: i64, record: &GazeSessionRecord) -> Result<i64>;
}
