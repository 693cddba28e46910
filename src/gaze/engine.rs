use super::calibration::{CalibrationSession, CalibrationTarget, ClickOutcome, RejectReason};
use super::device::{Camera, GazePredictor, ModelStore, PredictorConfig, StoredCalibration};
use super::mapping::{compute_domain, CalibrationDomain};
use super::smoothing::{GazeSmoother, Smoothing};
use super::validation::{validate_calibration, CalibrationResult};
use super::{GazeSample, Point, Viewport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::Pause;
use chrono::Utc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a gaze engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready { calibrated: bool },
    Calibrating,
    Tracking,
    Paused { calibrated: bool },
    TornDown,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready { .. } => "ready",
            Self::Calibrating => "calibrating",
            Self::Tracking => "tracking",
            Self::Paused { .. } => "paused",
            Self::TornDown => "torn-down",
        }
    }

    /// Model started and camera acquired at some point
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Ready { .. } | Self::Calibrating | Self::Tracking | Self::Paused { .. }
        )
    }
}

/// Engine knobs taken from the app config
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub clicks_per_point: u32,
    pub calibration_margin_px: f64,
    pub warmup: Duration,
    pub settle: Duration,
    pub smoothing: Smoothing,
    pub regression: String,
    pub face_tracker: String,
    pub debug: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            clicks_per_point: cfg.clicks_per_point,
            calibration_margin_px: cfg.calibration_margin_px,
            warmup: Duration::from_millis(cfg.warmup_ms),
            settle: Duration::from_millis(cfg.settle_ms),
            smoothing: cfg.smoothing,
            regression: cfg.regression.clone(),
            face_tracker: cfg.face_tracker.clone(),
            debug: cfg.debug,
        }
    }
}

impl EngineSettings {
    fn predictor_config(&self) -> PredictorConfig {
        PredictorConfig {
            regression: self.regression.clone(),
            face_tracker: self.face_tracker.clone(),
            kalman_filter: self.smoothing.uses_model_filter(),
        }
    }
}

// construction failures surface as one kind, whatever the model reported
fn model_init(e: Error) -> Error {
    match e {
        Error::ModelInitialization(_) | Error::PermissionDenied(_) => e,
        other => Error::ModelInitialization(other.to_string()),
    }
}

/// Owns the camera and the prediction model for one page session and
/// drives them through calibration and tracking.
///
/// Samples pushed by the model are routed in [`GazeEngine::pump`]: into a
/// pending calibration buffer while calibrating, into the tracking buffer
/// while tracking, and dropped otherwise. Pending samples replace the
/// committed calibration only once they are validated.
pub struct GazeEngine<C: Camera, P: GazePredictor, M: ModelStore, W: Pause> {
    camera: C,
    predictor: P,
    store: M,
    pause: W,
    settings: EngineSettings,
    state: EngineState,
    samples: Option<Receiver<GazeSample>>,
    smoother: GazeSmoother,
    session: Option<CalibrationSession>,
    calibration_samples: Vec<GazeSample>,
    pending_samples: Vec<GazeSample>,
    tracking_samples: Vec<GazeSample>,
    last_result: Option<CalibrationResult>,
    /// Model exported at pause, re-imported if resuming needs a full restart
    paused_model: Option<serde_json::Value>,
    wipe_storage_on_init: bool,
    debug: bool,
}

impl<C: Camera, P: GazePredictor, M: ModelStore, W: Pause> GazeEngine<C, P, M, W> {
    pub fn new(camera: C, predictor: P, store: M, pause: W, settings: EngineSettings) -> Self {
        Self {
            camera,
            predictor,
            store,
            pause,
            smoother: GazeSmoother::new(settings.smoothing),
            debug: settings.debug,
            settings,
            state: EngineState::Uninitialized,
            samples: None,
            session: None,
            calibration_samples: Vec::new(),
            pending_samples: Vec::new(),
            tracking_samples: Vec::new(),
            last_result: None,
            paused_model: None,
            wipe_storage_on_init: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    pub fn predictor_mut(&mut self) -> &mut P {
        &mut self.predictor
    }

    pub fn last_calibration(&self) -> Option<&CalibrationResult> {
        self.last_result.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.last_result.as_ref().is_some_and(|r| r.is_valid)
    }

    pub fn calibration_samples(&self) -> &[GazeSample] {
        &self.calibration_samples
    }

    pub fn calibration_domain(&self) -> Option<CalibrationDomain> {
        compute_domain(&self.calibration_samples)
    }

    pub fn calibration_targets(&self) -> Option<&[CalibrationTarget]> {
        self.session.as_ref().map(|s| s.targets())
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn will_wipe_storage(&self) -> bool {
        self.wipe_storage_on_init
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!("gaze engine {} -> {}", self.state.as_str(), state.as_str());
        }
        self.state = state;
    }

    /// Acquire the camera, start the model and restore a stored calibration.
    ///
    /// Calling again once initialized, or while initializing, does nothing.
    pub fn initialize(&mut self) -> Result<()> {
        match self.state {
            EngineState::Initializing => {
                debug!("initialize already in progress");
                return Ok(());
            }
            s if s.is_running() => return Ok(()),
            _ => {}
        }

        self.set_state(EngineState::Initializing);
        match self.boot() {
            Ok(()) => {
                let calibrated = self.is_calibrated();
                self.set_state(EngineState::Ready { calibrated });
                info!("gaze engine ready (calibrated: {})", calibrated);
                Ok(())
            }
            Err(e) => {
                warn!("gaze engine failed to initialize: {}", e);
                if let Err(e) = self.predictor.end() {
                    warn!("model end failed after initialize error: {}", e);
                }
                self.camera.stop_tracks();
                self.samples = None;
                self.set_state(EngineState::Uninitialized);
                Err(e)
            }
        }
    }

    fn boot(&mut self) -> Result<()> {
        self.camera.request_permission()?;
        self.camera.open_stream()?;

        let wipe = std::mem::take(&mut self.wipe_storage_on_init);
        if wipe {
            // must happen before the model starts or it reloads the old data
            if let Err(e) = self.store.clear() {
                warn!("could not wipe stored calibration: {}", e);
            }
            self.predictor.clear_model();
        }

        self.start_model()?;
        self.pause.wait(self.settings.warmup);

        if !wipe && self.last_result.is_none() {
            self.restore_persisted();
        }
        Ok(())
    }

    fn start_model(&mut self) -> Result<()> {
        self.predictor
            .configure(&self.settings.predictor_config())
            .map_err(model_init)?;
        let (tx, rx) = mpsc::channel();
        self.predictor.set_sample_sink(tx);
        self.samples = Some(rx);
        self.predictor.start().map_err(model_init)?;
        self.predictor.set_debug_overlay(self.debug);
        Ok(())
    }

    /// Load a stored calibration into the model. Returns whether one was used.
    fn restore_persisted(&mut self) -> bool {
        let stored = match self.store.load() {
            Ok(Some(stored)) if stored.result.is_valid => stored,
            Ok(_) => return false,
            Err(e) => {
                warn!("could not read stored calibration: {}", e);
                return false;
            }
        };
        if let Err(e) = self.predictor.import_model(&stored.model) {
            warn!("stored calibration rejected by model: {}", e);
            return false;
        }
        self.predictor.set_self_learning(false);
        info!(
            "restored calibration from {} ({} points)",
            stored.saved_at, stored.result.points_collected
        );
        self.calibration_samples = stored.samples;
        self.last_result = Some(stored.result);
        true
    }

    /// Drain predictions delivered since the last call. Returns how many
    /// arrived, including any dropped because no session was active.
    pub fn pump(&mut self) -> usize {
        let Some(rx) = &self.samples else {
            return 0;
        };
        let mut received = 0;
        while let Ok(sample) = rx.try_recv() {
            received += 1;
            let sample = self.smoother.smooth(sample);
            match self.state {
                EngineState::Calibrating => self.pending_samples.push(sample),
                EngineState::Tracking => self.tracking_samples.push(sample),
                _ => {}
            }
        }
        received
    }

    fn discard_pending(&mut self) {
        if let Some(rx) = &self.samples {
            let dropped = rx.try_iter().count();
            if dropped > 0 {
                debug!("discarded {} stale samples", dropped);
            }
        }
        self.smoother.reset();
    }

    fn prepare_session(&mut self) -> Result<()> {
        match self.state {
            EngineState::Uninitialized | EngineState::TornDown => self.initialize(),
            EngineState::Paused { .. } => self.try_resume(),
            EngineState::Ready { .. } | EngineState::Calibrating => Ok(()),
            s @ (EngineState::Initializing | EngineState::Tracking) => {
                Err(Error::InvalidState(s.as_str().to_string()))
            }
        }
    }

    fn begin_calibration(&mut self) -> Result<()> {
        self.prepare_session()?;
        self.discard_pending();
        self.pending_samples.clear();
        self.predictor.set_self_learning(true);
        self.set_state(EngineState::Calibrating);
        Ok(())
    }

    /// Start the supervised 9-point calibration and return its targets.
    pub fn start_calibration(&mut self, viewport: Viewport) -> Result<Vec<CalibrationTarget>> {
        self.begin_calibration()?;
        let session = CalibrationSession::nine_point(
            viewport,
            self.settings.calibration_margin_px,
            self.settings.clicks_per_point,
        );
        let targets = session.targets().to_vec();
        self.session = Some(session);
        Ok(targets)
    }

    /// Start collecting calibration samples while the user clicks freely.
    /// Ends with [`GazeEngine::finish_calibration`].
    pub fn start_free_calibration(&mut self) -> Result<()> {
        self.begin_calibration()?;
        self.session = None;
        info!("free-viewing calibration started");
        Ok(())
    }

    /// A click on calibration target `index` at screen position `at`.
    ///
    /// Accepted clicks train the model. The click that completes the last
    /// target triggers validation after the settle delay.
    pub fn confirm_target(&mut self, index: usize, at: Point) -> Result<ClickOutcome> {
        if self.state != EngineState::Calibrating {
            return Ok(ClickOutcome::Rejected(RejectReason::NotCalibrating));
        }
        self.pump();
        let Some(session) = self.session.as_mut() else {
            return Ok(ClickOutcome::Rejected(RejectReason::NotCalibrating));
        };
        let outcome = session.confirm(index);
        if !matches!(outcome, ClickOutcome::Rejected(_)) {
            self.predictor.record_click(at.x, at.y);
        }
        if outcome == ClickOutcome::CalibrationComplete {
            self.pause.wait(self.settings.settle);
            self.validate_calibration();
        }
        Ok(outcome)
    }

    /// A click anywhere during free-viewing calibration. Returns whether it
    /// was used for training.
    pub fn record_click(&mut self, at: Point) -> bool {
        if self.state != EngineState::Calibrating || self.session.is_some() {
            return false;
        }
        self.pump();
        self.predictor.record_click(at.x, at.y);
        true
    }

    pub fn finish_calibration(&mut self) -> Result<CalibrationResult> {
        if self.state != EngineState::Calibrating {
            return Err(Error::InvalidState(self.state.as_str().to_string()));
        }
        Ok(self.validate_calibration())
    }

    /// Judge the collected calibration samples and cache the verdict.
    ///
    /// Samples collected by a running calibration become the committed
    /// calibration here, whatever the verdict. Self-learning is switched off afterwards so pointer activity during
    /// tracking does not retrain the model.
    pub fn validate_calibration(&mut self) -> CalibrationResult {
        self.pump();
        if self.state == EngineState::Calibrating {
            self.calibration_samples = std::mem::take(&mut self.pending_samples);
        }
        let result = validate_calibration(&self.calibration_samples);
        match &result.error_message {
            None => info!(
                "calibration valid: {} points, confidence {:.2}, lighting {}",
                result.points_collected, result.average_confidence, result.lighting_quality
            ),
            Some(msg) => warn!("calibration invalid: {}", msg),
        }

        self.predictor.set_self_learning(false);
        self.session = None;
        if result.is_valid {
            self.persist(&result);
        }
        self.last_result = Some(result.clone());
        if matches!(
            self.state,
            EngineState::Calibrating | EngineState::Ready { .. }
        ) {
            self.set_state(EngineState::Ready {
                calibrated: result.is_valid,
            });
        }
        result
    }

    fn persist(&mut self, result: &CalibrationResult) {
        let stored = StoredCalibration {
            result: result.clone(),
            samples: self.calibration_samples.clone(),
            model: self
                .predictor
                .export_model()
                .unwrap_or(serde_json::Value::Null),
            saved_at: Utc::now(),
        };
        if let Err(e) = self.store.save(&stored) {
            warn!("could not persist calibration: {}", e);
        }
    }

    /// Begin a tracking session on the current calibration.
    pub fn start_tracking(&mut self) -> Result<()> {
        self.prepare_session()?;
        if self.state == EngineState::Calibrating {
            return Err(Error::InvalidState("calibrating".to_string()));
        }
        if !self.is_calibrated() && !self.restore_persisted() {
            return Err(match &self.last_result {
                Some(r) => Error::CalibrationInvalid(
                    r.error_message
                        .clone()
                        .unwrap_or_else(|| "calibration failed".to_string()),
                ),
                None => Error::CalibrationInvalid("no calibration available".to_string()),
            });
        }

        self.discard_pending();
        self.tracking_samples.clear();
        self.predictor.set_self_learning(false);
        self.set_state(EngineState::Tracking);
        info!("gaze tracking started");
        Ok(())
    }

    /// End the tracking session and hand over its samples.
    pub fn stop_tracking(&mut self) -> Vec<GazeSample> {
        if self.state == EngineState::Tracking {
            self.pump();
            let calibrated = self.is_calibrated();
            self.set_state(EngineState::Ready { calibrated });
        }
        let samples = std::mem::take(&mut self.tracking_samples);
        info!("gaze tracking stopped with {} samples", samples.len());
        samples
    }

    /// Release the camera while keeping the trained model.
    pub fn pause(&mut self) {
        let calibrated = match self.state {
            EngineState::Ready { calibrated } => calibrated,
            EngineState::Tracking => {
                self.pump();
                true
            }
            EngineState::Calibrating => {
                // an unfinished calibration is abandoned
                self.session = None;
                let dropped = std::mem::take(&mut self.pending_samples).len();
                debug!("dropped {} unvalidated calibration samples", dropped);
                self.is_calibrated()
            }
            _ => {
                debug!("pause ignored while {}", self.state.as_str());
                return;
            }
        };

        self.paused_model = self.predictor.export_model();
        self.camera.stop_tracks();
        if let Err(e) = self.predictor.pause() {
            warn!("model pause failed: {}", e);
        }
        self.predictor.set_debug_overlay(false);
        self.set_state(EngineState::Paused { calibrated });
        info!("gaze engine paused");
    }

    /// Alias of [`GazeEngine::pause`]
    pub fn stop_webcam(&mut self) {
        self.pause()
    }

    /// Resume after a pause. Failures are logged and the engine stays paused.
    pub fn resume(&mut self) {
        if let Err(e) = self.try_resume() {
            warn!("resume failed: {}", e);
        }
    }

    fn try_resume(&mut self) -> Result<()> {
        let EngineState::Paused { calibrated } = self.state else {
            return Ok(());
        };
        if let Err(e) = self.soft_resume() {
            warn!("soft resume failed, restarting model: {}", e);
            self.full_restart()?;
        }
        self.predictor.set_debug_overlay(self.debug);
        self.paused_model = None;
        self.set_state(EngineState::Ready { calibrated });
        info!("gaze engine resumed");
        Ok(())
    }

    fn soft_resume(&mut self) -> Result<()> {
        self.camera.open_stream()?;
        self.predictor.resume()
    }

    fn full_restart(&mut self) -> Result<()> {
        if let Err(e) = self.predictor.end() {
            warn!("model end failed during restart: {}", e);
        }
        self.camera.stop_tracks();
        self.camera.request_permission()?;
        self.camera.open_stream()?;
        self.start_model()?;
        self.pause.wait(self.settings.warmup);

        if let Some(model) = self.paused_model.take() {
            self.predictor.import_model(&model)?;
            self.predictor.set_self_learning(false);
        } else if self.is_calibrated() {
            self.last_result = None;
            self.restore_persisted();
        }
        Ok(())
    }

    /// Stop everything and forget in-memory state. The engine must be
    /// initialized again before further use.
    pub fn teardown(&mut self) {
        if let Err(e) = self.predictor.end() {
            warn!("model end failed during teardown: {}", e);
        }
        self.camera.stop_tracks();
        self.samples = None;
        self.session = None;
        self.calibration_samples.clear();
        self.pending_samples.clear();
        self.tracking_samples.clear();
        self.last_result = None;
        self.paused_model = None;
        self.smoother.reset();
        self.set_state(EngineState::TornDown);
        info!("gaze engine torn down");
    }

    /// Alias of [`GazeEngine::teardown`]
    pub fn cleanup(&mut self) {
        self.teardown()
    }

    /// Forget the trained calibration everywhere, including durable storage.
    ///
    /// The next `initialize` wipes storage again before starting the model.
    pub fn clear_calibration_data(&mut self) -> Result<()> {
        self.predictor.clear_model();
        if let Err(e) = self.predictor.end() {
            warn!("model end failed while clearing calibration: {}", e);
        }
        self.camera.stop_tracks();
        self.samples = None;
        self.session = None;
        self.calibration_samples.clear();
        self.pending_samples.clear();
        self.tracking_samples.clear();
        self.last_result = None;
        self.paused_model = None;
        self.wipe_storage_on_init = true;
        self.set_state(EngineState::Uninitialized);
        info!("calibration data cleared");
        self.store.clear()
    }

    /// Show or hide the video preview and prediction markers.
    pub fn set_debug(&mut self, visible: bool) {
        self.debug = visible;
        if matches!(
            self.state,
            EngineState::Ready { .. } | EngineState::Calibrating | EngineState::Tracking
        ) {
            self.predictor.set_debug_overlay(visible);
        }
    }
}
