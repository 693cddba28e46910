//! Software stand-ins for the camera and the prediction model, used by the
//! `gazalyzer gaze demo` command and the tests.

use super::device::{Camera, GazePredictor, PredictorConfig};
use super::{GazeSample, Point};
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use tracing::debug;

/// Regression algorithms the simulated model accepts
pub const REGRESSIONS: [&str; 3] = ["ridge", "weightedRidge", "threadedRidge"];

/// Milliseconds between simulated frames
pub const FRAME_MS: i64 = 200;

#[derive(Debug, Clone, Default)]
pub struct SimulatedCamera {
    pub deny_permission: bool,
    streaming: bool,
    pub opened: u32,
    pub stop_calls: u32,
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny_permission: true,
            ..Self::default()
        }
    }
}

impl Camera for SimulatedCamera {
    fn request_permission(&mut self) -> Result<()> {
        if self.deny_permission {
            return Err(Error::PermissionDenied(
                "camera access was refused; allow it in the browser settings".to_string(),
            ));
        }
        Ok(())
    }

    fn open_stream(&mut self) -> Result<()> {
        self.streaming = true;
        self.opened += 1;
        Ok(())
    }

    fn stop_tracks(&mut self) {
        self.stop_calls += 1;
        self.streaming = false;
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SimModel {
    bias: (f64, f64),
    clicks: u32,
}

/// Predicts the point the simulated user looks at, off by a bias that
/// shrinks with every training click, plus seeded noise.
#[derive(Debug)]
pub struct SimulatedPredictor {
    config: Option<PredictorConfig>,
    sink: Option<Sender<GazeSample>>,
    rng: StdRng,
    model: SimModel,
    initial_bias: (f64, f64),
    target: Point,
    clock_ms: i64,
    pub noise_px: f64,
    pub confidence: f64,
    pub running: bool,
    pub paused: bool,
    pub self_learning: bool,
    pub debug_overlay: bool,
    pub fail_soft_resume: bool,
    pub starts: u32,
    pub ends: u32,
}

impl SimulatedPredictor {
    pub fn new(seed: u64) -> Self {
        let initial_bias = (60.0, -40.0);
        Self {
            config: None,
            sink: None,
            rng: StdRng::seed_from_u64(seed),
            model: SimModel {
                bias: initial_bias,
                clicks: 0,
            },
            initial_bias,
            target: Point::new(0.0, 0.0),
            clock_ms: 0,
            noise_px: 8.0,
            confidence: 0.7,
            running: false,
            paused: false,
            self_learning: true,
            debug_overlay: false,
            fail_soft_resume: false,
            starts: 0,
            ends: 0,
        }
    }

    pub fn training_clicks(&self) -> u32 {
        self.model.clicks
    }

    /// Point the simulated user is looking at
    pub fn look_at(&mut self, target: Point) {
        self.target = target;
    }

    /// Process one frame, emitting a sample if running.
    pub fn tick(&mut self) {
        self.clock_ms += FRAME_MS;
        if !self.running || self.paused {
            return;
        }
        let Some(sink) = &self.sink else {
            return;
        };
        let jitter = self.noise_px;
        let sample = GazeSample {
            x: self.target.x + self.model.bias.0 + self.rng.gen_range(-jitter..=jitter),
            y: self.target.y + self.model.bias.1 + self.rng.gen_range(-jitter..=jitter),
            timestamp: self.clock_ms,
            confidence: (self.confidence + self.rng.gen_range(-0.05..=0.05)).clamp(0.0, 1.0),
        };
        // the engine may already have dropped its receiver
        let _ = sink.send(sample);
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }
}

impl GazePredictor for SimulatedPredictor {
    fn configure(&mut self, config: &PredictorConfig) -> Result<()> {
        if !REGRESSIONS.contains(&config.regression.as_str()) {
            return Err(Error::ModelInitialization(format!(
                "unknown regression algorithm '{}'",
                config.regression
            )));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn set_sample_sink(&mut self, sink: Sender<GazeSample>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) -> Result<()> {
        if self.config.is_none() {
            return Err(Error::ModelInitialization("model not configured".to_string()));
        }
        self.running = true;
        self.paused = false;
        self.starts += 1;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.fail_soft_resume {
            return Err(Error::Model("video element lost, restart required".to_string()));
        }
        self.paused = false;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.running {
            self.ends += 1;
        }
        self.running = false;
        self.sink = None;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.running && self.config.is_some()
    }

    fn record_click(&mut self, x: f64, y: f64) {
        self.target = Point::new(x, y);
        if self.self_learning {
            self.model.clicks += 1;
            self.model.bias = (self.model.bias.0 * 0.8, self.model.bias.1 * 0.8);
        }
    }

    fn set_self_learning(&mut self, enabled: bool) {
        self.self_learning = enabled;
    }

    fn set_debug_overlay(&mut self, visible: bool) {
        self.debug_overlay = visible;
    }

    fn export_model(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.model).ok()
    }

    fn import_model(&mut self, model: &serde_json::Value) -> Result<()> {
        self.model = serde_json::from_value(model.clone())?;
        debug!("simulated model restored after {} clicks", self.model.clicks);
        Ok(())
    }

    fn clear_model(&mut self) {
        self.model = SimModel {
            bias: self.initial_bias,
            clicks: 0,
        };
    }
}
