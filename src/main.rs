use clap::{Args, Parser, Subcommand};
use gazalyzer::app_dirs::AppDirs;
use gazalyzer::composition::{above_threshold, top_k, CompositionClassifier};
use gazalyzer::config::{ConfigStore, FileConfigStore};
use gazalyzer::experiments::{create_experiment, ExperimentKind, ExperimentRequest};
use gazalyzer::gaze::device::{FileModelStore, ModelStore};
use gazalyzer::gaze::engine::{EngineSettings, GazeEngine};
use gazalyzer::gaze::fixation::FixationParams;
use gazalyzer::gaze::pipeline::{build_session_record, write_csv, SessionContext};
use gazalyzer::gaze::sim::{SimulatedCamera, SimulatedPredictor};
use gazalyzer::gaze::validation::validate_gaze_data;
use gazalyzer::gaze::{GazeSample, ImageBounds, Point, Viewport};
use gazalyzer::quota::{Caller, QuotaLedger, Tier};
use gazalyzer::runtime::{FixedTicker, Runner, SessionEvent, ThreadPause};
use gazalyzer::session::GazeSessionStore;
use gazalyzer::store::Db;
use gazalyzer::{Error, Result};
use std::fs::File;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// gaze calibration, experiment quotas and composition analysis for image studies
#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Cli {
    /// database file (defaults to the platform state directory)
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    /// log debug output
    #[clap(short = 'v', long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// manage registered users
    #[clap(subcommand)]
    User(UserCommand),
    /// manage pictures
    #[clap(subcommand)]
    Picture(PictureCommand),
    /// show the experiments a caller has left
    Quota(CallerArgs),
    /// run an experiment on a picture, charging quota if it is new
    Experiment {
        picture_id: i64,
        #[clap(long, value_enum)]
        kind: ExperimentKind,
        #[clap(flatten)]
        caller: CallerArgs,
    },
    /// webcam gaze tools
    #[clap(subcommand)]
    Gaze(GazeCommand),
    /// score CLIP features with the composition classifier
    Classify {
        /// exported MLP weights
        weights: PathBuf,
        /// JSON array of features
        features: PathBuf,
        #[clap(long, default_value_t = 3)]
        top: usize,
        #[clap(long)]
        threshold: Option<f64>,
        /// comma separated class names
        #[clap(long, value_delimiter = ',')]
        labels: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Add {
        id: String,
        #[clap(long, value_parser = parse_tier, default_value = "free")]
        tier: Tier,
    },
    List,
    /// change a user's subscription tier
    Tier {
        id: String,
        #[clap(value_parser = parse_tier)]
        tier: Tier,
    },
}

#[derive(Subcommand, Debug)]
enum PictureCommand {
    Add {
        name: String,
        #[clap(flatten)]
        owner: CallerArgs,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum GazeCommand {
    /// calibrate and track with simulated devices
    Demo {
        #[clap(long, default_value_t = 7)]
        seed: u64,
        #[clap(long, default_value_t = 1280.0)]
        width: f64,
        #[clap(long, default_value_t = 720.0)]
        height: f64,
        /// natural image size as WIDTHxHEIGHT; the image fills the viewport
        #[clap(long, value_parser = parse_size)]
        image: Option<(f64, f64)>,
        /// calibrate even if a stored calibration exists
        #[clap(long)]
        recalibrate: bool,
        /// attach the session to this experiment
        #[clap(long)]
        experiment: Option<i64>,
        /// write mapped samples here
        #[clap(long)]
        csv: Option<PathBuf>,
    },
    /// screen recorded samples (CSV with x,y,timestamp,confidence)
    Validate { samples: PathBuf },
    /// forget the stored calibration
    Clear,
}

#[derive(Args, Debug, Clone)]
#[clap(group(clap::ArgGroup::new("caller").required(true).args(["user", "ip"])))]
struct CallerArgs {
    /// registered user id
    #[clap(long)]
    user: Option<String>,
    /// anonymous caller address
    #[clap(long)]
    ip: Option<String>,
}

impl CallerArgs {
    fn caller(&self) -> Caller {
        match (&self.user, &self.ip) {
            (Some(user), _) => Caller::user(user),
            (None, Some(ip)) => Caller::anonymous(ip),
            // clap requires one of the two
            (None, None) => Caller::anonymous("0.0.0.0"),
        }
    }
}

fn parse_tier(s: &str) -> std::result::Result<Tier, String> {
    s.parse::<Tier>()
        .map_err(|_| format!("unknown tier '{}', expected free, premium or professional", s))
}

fn parse_size(s: &str) -> std::result::Result<(f64, f64), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let w: f64 = w.trim().parse().map_err(|e| format!("width: {}", e))?;
    let h: f64 = h.trim().parse().map_err(|e| format!("height: {}", e))?;
    Ok((w, h))
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "gazalyzer=debug"
    } else {
        "gazalyzer=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_db(cli: &Cli) -> Result<Db> {
    let path = cli
        .db
        .clone()
        .or_else(AppDirs::db_path)
        .unwrap_or_else(|| PathBuf::from("gazalyzer.db"));
    Db::open(path)
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        debug!("{:?}", e);
        eprintln!("error: {}", e);
        std::process::exit(if e.is_quota_exceeded() { 2 } else { 1 });
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::User(cmd) => run_user(&open_db(cli)?, cmd),
        Command::Picture(cmd) => run_picture(&open_db(cli)?, cmd),
        Command::Quota(caller) => {
            let db = open_db(cli)?;
            let info = QuotaLedger::new(&db).allotment_info(&caller.caller())?;
            println!("{}", info);
            Ok(())
        }
        Command::Experiment {
            picture_id,
            kind,
            caller,
        } => {
            let db = open_db(cli)?;
            let request = ExperimentRequest {
                caller: caller.caller(),
                picture_id: *picture_id,
                kind: *kind,
            };
            let experiment = create_experiment(&db, &request, chrono::Utc::now())?;
            println!(
                "experiment {} ({}) on picture {}{}",
                experiment.id,
                experiment.kind,
                experiment.picture_id,
                if experiment.charged { "" } else { ", not charged" }
            );
            Ok(())
        }
        Command::Gaze(cmd) => run_gaze(cli, cmd),
        Command::Classify {
            weights,
            features,
            top,
            threshold,
            labels,
        } => {
            let mut classifier = CompositionClassifier::load(weights)?;
            if !labels.is_empty() {
                classifier = classifier.with_labels(labels.clone())?;
            }
            let features: Vec<f64> = serde_json::from_reader(File::open(features)?)?;
            let scores = classifier.classify(&features)?;
            let picked = match threshold {
                Some(t) => above_threshold(&scores, *t),
                None => top_k(&scores, *top),
            };
            for score in picked {
                println!("{}\t{:.4}", score.label, score.score);
            }
            Ok(())
        }
    }
}

fn run_user(db: &Db, cmd: &UserCommand) -> Result<()> {
    let ledger = QuotaLedger::new(db);
    match cmd {
        UserCommand::Add { id, tier } => {
            db.add_user(id, *tier, chrono::Utc::now())?;
            println!("{}", ledger.allotment_info(&Caller::user(id))?);
        }
        UserCommand::List => {
            let now = chrono::Utc::now();
            for (id, _) in db.users()? {
                println!("{}\t{}", id, ledger.allotment_info_at(&Caller::user(&id), now)?);
            }
        }
        UserCommand::Tier { id, tier } => {
            ledger.change_tier(id, *tier)?;
            println!("{}", ledger.allotment_info(&Caller::user(id))?);
        }
    }
    Ok(())
}

fn run_picture(db: &Db, cmd: &PictureCommand) -> Result<()> {
    match cmd {
        PictureCommand::Add { name, owner } => {
            let picture = db.add_picture(&owner.caller(), name, chrono::Utc::now())?;
            println!("{}", picture.id);
        }
        PictureCommand::List => {
            for p in db.pictures()? {
                let owner = match &p.owner {
                    Caller::User(id) => id.clone(),
                    Caller::Anonymous { ip } => ip.clone(),
                };
                println!(
                    "{}\t{}\t{}\t{} experiments",
                    p.id,
                    p.name,
                    owner,
                    db.experiment_count(p.id)?
                );
            }
        }
    }
    Ok(())
}

fn run_gaze(cli: &Cli, cmd: &GazeCommand) -> Result<()> {
    match cmd {
        GazeCommand::Demo {
            seed,
            width,
            height,
            image,
            recalibrate,
            experiment,
            csv,
        } => {
            let viewport = Viewport::new(*width, *height);
            let image = image.map(|(natural_width, natural_height)| ImageBounds {
                left: 0.0,
                top: 0.0,
                width: viewport.width,
                height: viewport.height,
                natural_width,
                natural_height,
            });
            // resolve the experiment before spending time on the session
            let db = match experiment {
                Some(id) => {
                    let db = open_db(cli)?;
                    db.experiment(*id)?
                        .ok_or_else(|| Error::NotFound(format!("experiment {}", id)))?;
                    Some(db)
                }
                None => None,
            };

            let samples = run_demo(*seed, viewport, image, *recalibrate, csv.as_ref())?;
            if let (Some(db), Some(id)) = (db, experiment) {
                let session = db.save_gaze_session(*id, &samples)?;
                println!("saved gaze session {}", session);
            }
            Ok(())
        }
        GazeCommand::Validate { samples } => {
            let mut reader = csv::Reader::from_path(samples)?;
            let samples = reader
                .deserialize()
                .collect::<std::result::Result<Vec<GazeSample>, csv::Error>>()?;
            let validation = validate_gaze_data(&samples);
            println!(
                "{} of {} samples usable",
                validation.valid_samples.len(),
                samples.len()
            );
            if validation.is_valid {
                println!("valid");
            }
            for issue in &validation.issues {
                println!("issue: {}", issue);
            }
            Ok(())
        }
        GazeCommand::Clear => {
            FileModelStore::new().clear()?;
            println!("stored calibration removed");
            Ok(())
        }
    }
}

/// Points the simulated viewer studies, as fractions of the viewport
const VIEWING_PATH: [(f64, f64); 4] = [(0.33, 0.33), (0.66, 0.33), (0.5, 0.66), (0.2, 0.8)];
const DWELL_FRAMES: usize = 10;

fn run_demo(
    seed: u64,
    viewport: Viewport,
    image: Option<ImageBounds>,
    recalibrate: bool,
    csv: Option<&PathBuf>,
) -> Result<gazalyzer::session::GazeSessionRecord> {
    let cfg = FileConfigStore::new().load();
    let settings = EngineSettings::from(&cfg);
    let mut engine = GazeEngine::new(
        SimulatedCamera::new(),
        SimulatedPredictor::new(seed),
        FileModelStore::new(),
        ThreadPause,
        settings,
    );

    engine.initialize()?;
    if recalibrate || !engine.is_calibrated() {
        let targets = engine.start_calibration(viewport)?;
        let (tx, rx) = mpsc::channel();
        for _ in 0..cfg.clicks_per_point {
            for t in &targets {
                // silently ignored if the runner is gone
                let _ = tx.send(SessionEvent::TargetClick {
                    index: t.index,
                    at: t.position,
                });
            }
        }
        drop(tx);

        let runner = Runner::new(rx, FixedTicker::new(Duration::from_millis(cfg.tick_ms)));
        while engine.last_calibration().is_none() || engine.calibration_targets().is_some() {
            match runner.step() {
                SessionEvent::TargetClick { index, at } => {
                    engine.predictor_mut().look_at(at);
                    engine.predictor_mut().tick();
                    let outcome = engine.confirm_target(index, at)?;
                    debug!("target {} -> {:?}", index, outcome);
                }
                SessionEvent::Click(at) => {
                    engine.record_click(at);
                }
                SessionEvent::Tick => break,
            }
        }
    }

    let calibration = engine
        .last_calibration()
        .cloned()
        .ok_or_else(|| Error::CalibrationInvalid("calibration did not finish".to_string()))?;
    println!(
        "calibration: valid={} points={} confidence={:.2} lighting={} camera={}",
        calibration.is_valid,
        calibration.points_collected,
        calibration.average_confidence,
        calibration.lighting_quality,
        calibration.camera_positioning
    );
    calibration.ensure_valid()?;

    engine.start_tracking()?;
    for (fx, fy) in VIEWING_PATH {
        engine
            .predictor_mut()
            .look_at(Point::new(fx * viewport.width, fy * viewport.height));
        engine.predictor_mut().ticks(DWELL_FRAMES);
        engine.pump();
    }
    let samples = engine.stop_tracking();

    let ctx = SessionContext {
        calibration_samples: engine.calibration_samples(),
        calibration: Some(&calibration),
        viewport,
        image,
        fixation: FixationParams::from(&cfg),
    };
    let analysis = build_session_record(&samples, &ctx);
    engine.teardown();

    let record = analysis.record;
    println!(
        "tracking: {} samples, {} kept, {} extrapolated, {} fixations, {} ms",
        samples.len(),
        record.gaze_points.len(),
        analysis.extrapolated,
        record.fixation_count(),
        record.session_duration.unwrap_or(0)
    );
    if let Some(stats) = record.confidence_stats() {
        println!(
            "confidence: mean {:.2}, std dev {:.3}",
            stats.mean, stats.std_dev
        );
    }
    for issue in &analysis.validation.issues {
        println!("issue: {}", issue);
    }
    if let Some(path) = csv {
        write_csv(File::create(path)?, &record.gaze_points)?;
        println!("samples written to {}", path.display());
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn experiment_requires_a_caller() {
        assert!(Cli::try_parse_from(["gazalyzer", "experiment", "1", "--kind", "value-study"]).is_err());
        let cli = Cli::try_parse_from([
            "gazalyzer",
            "experiment",
            "1",
            "--kind",
            "gaze-tracking",
            "--ip",
            "10.1.1.1",
        ])
        .unwrap();
        match cli.command {
            Command::Experiment { kind, caller, .. } => {
                assert_eq!(kind, ExperimentKind::GazeTracking);
                assert_eq!(caller.caller(), Caller::anonymous("10.1.1.1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn tier_and_size_parsing() {
        assert_eq!(parse_tier("Premium"), Ok(Tier::Premium));
        assert!(parse_tier("gold").is_err());
        assert_eq!(parse_size("1920x1080"), Ok((1920.0, 1080.0)));
        assert!(parse_size("1920").is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["gazalyzer", "user", "list", "--db", "x.db", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
    }
}
