//! Webcam gaze estimation: engine lifecycle, calibration, validation and the
//! coordinate spaces samples travel through.
//!
//! Raw predictions live in the model's own screen space. The calibration
//! domain (bounding box of calibration samples) is stretched onto the
//! viewport, and viewport points are finally projected onto an image's
//! natural pixel grid.

pub mod calibration;
pub mod device;
pub mod engine;
pub mod fixation;
pub mod mapping;
pub mod pipeline;
pub mod sim;
pub mod smoothing;
pub mod validation;

pub use calibration::{CalibrationSession, CalibrationTarget, ClickOutcome};
pub use device::{Camera, GazePredictor, ModelStore, PredictorConfig, StoredCalibration};
pub use engine::{EngineState, GazeEngine};
pub use mapping::{CalibrationDomain, ImageBounds, ViewportMapping};
pub use validation::{CalibrationResult, CameraPositioning, GazeDataValidation, LightingQuality};

use serde::{Deserialize, Serialize};

/// One estimate of where the user is looking
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazeSample {
    /// Predicted screen position, may fall outside the viewport
    pub x: f64,
    pub y: f64,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub confidence: f64,
}

impl GazeSample {
    pub fn new(x: f64, y: f64, timestamp: i64, confidence: f64) -> Self {
        Self {
            x,
            y,
            timestamp,
            confidence,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn with_point(self, p: Point) -> Self {
        Self {
            x: p.x,
            y: p.y,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Size of the page area gaze is reported against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(self.width / 2.0, self.height / 2.0)
    }
}

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
