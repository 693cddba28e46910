//! Capabilities the engine drives but does not implement: the camera, the
//! gaze-prediction model, and durable storage for a trained calibration.

use super::validation::CalibrationResult;
use super::GazeSample;
use crate::app_dirs::AppDirs;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use tracing::warn;

/// Video capture device
pub trait Camera {
    /// Ask for access. Refusal must be reported as `Error::PermissionDenied`.
    fn request_permission(&mut self) -> Result<()>;
    fn open_stream(&mut self) -> Result<()>;
    /// Release the video tracks. Safe to call when nothing is open.
    fn stop_tracks(&mut self);
    fn is_streaming(&self) -> bool;
}

/// Model setup applied before `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub regression: String,
    pub face_tracker: String,
    pub kalman_filter: bool,
}

/// A regression-based gaze predictor fed by a face-landmark tracker.
///
/// Samples are pushed into the sink registered with `set_sample_sink`,
/// one per processed frame, while the predictor is running.
pub trait GazePredictor {
    fn configure(&mut self, config: &PredictorConfig) -> Result<()>;
    fn set_sample_sink(&mut self, sink: Sender<GazeSample>);
    fn start(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;
    fn is_ready(&self) -> bool;
    /// Train on a click at screen position (x, y) and the current gaze.
    fn record_click(&mut self, x: f64, y: f64);
    /// Continuous learning from pointer movement and clicks.
    fn set_self_learning(&mut self, enabled: bool);
    /// Video preview and prediction markers.
    fn set_debug_overlay(&mut self, visible: bool);
    fn export_model(&self) -> Option<serde_json::Value>;
    fn import_model(&mut self, model: &serde_json::Value) -> Result<()>;
    fn clear_model(&mut self);
}

/// A trained calibration as kept across page loads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCalibration {
    pub result: CalibrationResult,
    /// Calibration samples, the calibration domain is recomputed from them
    pub samples: Vec<GazeSample>,
    pub model: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// Durable storage of the last valid calibration
pub trait ModelStore {
    fn load(&self) -> Result<Option<StoredCalibration>>;
    fn save(&self, calibration: &StoredCalibration) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileModelStore {
    path: PathBuf,
}

impl FileModelStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = AppDirs::calibration_path()
            .unwrap_or_else(|| PathBuf::from("gazalyzer_calibration.json"));
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStore for FileModelStore {
    fn load(&self) -> Result<Option<StoredCalibration>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                warn!("ignoring unreadable calibration at {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    fn save(&self, calibration: &StoredCalibration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(calibration)?)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
