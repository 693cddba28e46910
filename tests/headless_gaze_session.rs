use std::sync::mpsc;
use std::time::Duration;

use gazalyzer::experiments::{create_experiment, ExperimentKind, ExperimentRequest};
use gazalyzer::gaze::calibration::ClickOutcome;
use gazalyzer::gaze::device::{Camera, FileModelStore};
use gazalyzer::gaze::engine::{EngineSettings, EngineState, GazeEngine};
use gazalyzer::gaze::fixation::FixationParams;
use gazalyzer::gaze::pipeline::{build_session_record, SessionContext};
use gazalyzer::gaze::sim::{SimulatedCamera, SimulatedPredictor};
use gazalyzer::gaze::{Point, Viewport};
use gazalyzer::quota::{Caller, Tier};
use gazalyzer::runtime::{FixedTicker, NoPause, Runner, SessionEvent};
use gazalyzer::session::GazeSessionStore;
use gazalyzer::store::Db;

type SimEngine = GazeEngine<SimulatedCamera, SimulatedPredictor, FileModelStore, NoPause>;

fn engine(dir: &tempfile::TempDir) -> SimEngine {
    GazeEngine::new(
        SimulatedCamera::new(),
        SimulatedPredictor::new(3),
        FileModelStore::with_path(dir.path().join("calibration.json")),
        NoPause,
        EngineSettings::default(),
    )
}

// Drives a 9-point calibration from page events through the Runner, the
// way the binary does, then tracks and stores the session.
#[test]
fn headless_calibrate_track_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let viewport = Viewport::new(1024.0, 768.0);
    let mut engine = engine(&dir);
    let targets = engine.start_calibration(viewport).unwrap();
    assert_eq!(targets.len(), 9);

    let (tx, rx) = mpsc::channel();
    for _ in 0..5 {
        for t in &targets {
            tx.send(SessionEvent::TargetClick {
                index: t.index,
                at: t.position,
            })
            .unwrap();
            tx.send(SessionEvent::Tick).unwrap();
        }
    }
    drop(tx);

    let runner = Runner::new(rx, FixedTicker::new(Duration::from_millis(5)));
    let mut completed = false;
    for _ in 0..200u32 {
        match runner.step() {
            SessionEvent::TargetClick { index, at } => {
                engine.predictor_mut().look_at(at);
                engine.predictor_mut().tick();
                if engine.confirm_target(index, at).unwrap() == ClickOutcome::CalibrationComplete {
                    completed = true;
                    break;
                }
            }
            SessionEvent::Tick => {
                engine.predictor_mut().tick();
                engine.pump();
            }
            SessionEvent::Click(_) => {}
        }
    }
    assert!(completed, "calibration should complete");
    let calibration = engine.last_calibration().cloned().unwrap();
    assert!(calibration.is_valid, "{:?}", calibration.error_message);
    assert!(calibration.points_collected >= 45);
    assert_eq!(engine.state(), EngineState::Ready { calibrated: true });

    // look at two spots long enough to fixate on each
    engine.start_tracking().unwrap();
    for p in [Point::new(300.0, 300.0), Point::new(700.0, 500.0)] {
        engine.predictor_mut().look_at(p);
        engine.predictor_mut().ticks(10);
        engine.pump();
    }
    let samples = engine.stop_tracking();
    assert_eq!(samples.len(), 20);

    let ctx = SessionContext {
        calibration_samples: engine.calibration_samples(),
        calibration: Some(&calibration),
        viewport,
        image: None,
        fixation: FixationParams {
            max_dispersion: 80.0,
            min_duration_ms: 200,
        },
    };
    let analysis = build_session_record(&samples, &ctx);
    assert!(analysis.validation.is_valid, "{:?}", analysis.validation.issues);
    assert_eq!(analysis.record.fixation_count(), 2);
    assert_eq!(analysis.record.session_duration, Some(19 * 200));

    // attach to a gaze-tracking experiment
    let db = Db::open_in_memory().unwrap();
    let now = chrono::Utc::now();
    db.add_user("ana", Tier::Premium, now).unwrap();
    let pic = db.add_picture(&Caller::user("ana"), "portrait.jpg", now).unwrap();
    let experiment = create_experiment(
        &db,
        &ExperimentRequest {
            caller: Caller::user("ana"),
            picture_id: pic.id,
            kind: ExperimentKind::GazeTracking,
        },
        now,
    )
    .unwrap();
    db.save_gaze_session(experiment.id, &analysis.record).unwrap();

    let stored = db.gaze_sessions(experiment.id).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].fixation_count(), 2);
    assert_eq!(stored[0].calibration_data.as_ref(), Some(&calibration));

    engine.teardown();
    assert!(!engine.camera().is_streaming());
}

#[test]
fn free_viewing_calibration_collects_clicks() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&dir);
    engine.start_free_calibration().unwrap();

    for i in 0..30 {
        let at = Point::new(50.0 + (i % 6) as f64 * 150.0, 60.0 + (i / 6) as f64 * 120.0);
        engine.predictor_mut().look_at(at);
        engine.predictor_mut().tick();
        assert!(engine.record_click(at));
    }
    let result = engine.finish_calibration().unwrap();
    assert!(result.is_valid, "{:?}", result.error_message);
    assert_eq!(result.points_collected, 30);
    assert!(!engine.record_click(Point::new(0.0, 0.0)));
    assert!(engine.start_tracking().is_ok());
}

#[test]
fn calibration_survives_restart_until_cleared() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = engine(&dir);
        first.start_free_calibration().unwrap();
        for i in 0..25 {
            let at = Point::new((i % 5) as f64 * 200.0, (i / 5) as f64 * 150.0);
            first.predictor_mut().look_at(at);
            first.predictor_mut().tick();
            first.record_click(at);
        }
        assert!(first.finish_calibration().unwrap().is_valid);
        first.cleanup();
    }

    let mut second = engine(&dir);
    second.start_tracking().unwrap();
    assert_eq!(second.state(), EngineState::Tracking);
    second.stop_tracking();

    second.clear_calibration_data().unwrap();
    let mut third = engine(&dir);
    third.initialize().unwrap();
    assert!(!third.is_calibrated());
    assert!(third.start_tracking().is_err());
}
