use crate::gaze::smoothing::Smoothing;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Confirming clicks each calibration target needs
    pub clicks_per_point: u32,
    /// Distance of the calibration grid from the viewport edges, in px
    pub calibration_margin_px: f64,
    /// Wait after starting the model before looking for a stored calibration
    pub warmup_ms: u64,
    /// Wait after the last calibration click before validating
    pub settle_ms: u64,
    /// Expected interval between model predictions
    pub tick_ms: u64,
    pub smoothing: Smoothing,
    pub regression: String,
    pub face_tracker: String,
    pub debug: bool,
    pub fixation_dispersion_px: f64,
    pub fixation_min_duration_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clicks_per_point: 5,
            calibration_margin_px: 50.0,
            warmup_ms: 1000,
            settle_ms: 500,
            tick_ms: 200,
            smoothing: Smoothing::Filtered,
            regression: "ridge".to_string(),
            face_tracker: "TFFacemesh".to_string(),
            debug: false,
            fixation_dispersion_px: 50.0,
            fixation_min_duration_ms: 100,
        }
    }
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = if let Some(pd) = ProjectDirs::from("", "", "gazalyzer") {
            pd.config_dir().join("config.json")
        } else {
            PathBuf::from("gazalyzer_config.json")
        };
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        if let Ok(bytes) = fs::read(&self.path) {
            match serde_json::from_slice::<Config>(&bytes) {
                Ok(cfg) => return cfg,
                Err(e) => warn!("config {} unreadable, using defaults: {}", self.path.display(), e),
            }
        }
        Config::default()
    }

    fn save(&self, cfg: &Config) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}
