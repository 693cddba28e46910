//! Turns the raw samples of a tracking session into the record that gets
//! stored with a gaze-tracking experiment.

use super::fixation::{detect_fixations, scan_path, FixationParams};
use super::mapping::{compute_domain, map_to_image_coordinates, map_to_viewport, ImageBounds};
use super::validation::{validate_gaze_data, CalibrationResult, GazeDataValidation};
use super::{GazeSample, Viewport};
use crate::config::Config;
use crate::error::Result;
use crate::session::GazeSessionRecord;
use std::io::Write;
use tracing::{info, warn};

impl From<&Config> for FixationParams {
    fn from(cfg: &Config) -> Self {
        Self {
            max_dispersion: cfg.fixation_dispersion_px,
            min_duration_ms: cfg.fixation_min_duration_ms,
        }
    }
}

/// Context a tracking session was recorded in
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    pub calibration_samples: &'a [GazeSample],
    pub calibration: Option<&'a CalibrationResult>,
    pub viewport: Viewport,
    /// Displayed image; when set, points are reported in its pixel space
    pub image: Option<ImageBounds>,
    pub fixation: FixationParams,
}

#[derive(Debug, Clone)]
pub struct SessionAnalysis {
    pub record: GazeSessionRecord,
    pub validation: GazeDataValidation,
    /// Samples that fell outside the calibration domain
    pub extrapolated: usize,
}

/// Map raw predictions through viewport and image space, screen them, and
/// derive fixations and the scan path.
pub fn build_session_record(samples: &[GazeSample], ctx: &SessionContext<'_>) -> SessionAnalysis {
    let domain = compute_domain(ctx.calibration_samples);
    if domain.is_none() {
        warn!("no calibration samples, gaze will map to the viewport center");
    }

    let mut extrapolated = 0;
    let mapped: Vec<GazeSample> = samples
        .iter()
        .map(|s| {
            let m = map_to_viewport(s.point(), domain.as_ref(), ctx.viewport);
            if m.extrapolated {
                extrapolated += 1;
            }
            let on_screen = s.with_point(m.point);
            match &ctx.image {
                Some(bounds) => map_to_image_coordinates(&on_screen, bounds),
                None => on_screen,
            }
        })
        .collect();

    let validation = validate_gaze_data(&mapped);
    for issue in &validation.issues {
        warn!("gaze data: {}", issue);
    }

    let fixations = detect_fixations(&validation.valid_samples, ctx.fixation);
    let session_duration = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => Some(last.timestamp - first.timestamp),
        _ => None,
    };
    info!(
        "session analysed: {} of {} samples kept, {} fixations",
        validation.valid_samples.len(),
        samples.len(),
        fixations.len()
    );

    let record = GazeSessionRecord {
        gaze_points: validation.valid_samples.clone(),
        scan_path: Some(scan_path(&fixations)),
        fixation_points: Some(fixations),
        session_duration,
        calibration_data: ctx.calibration.cloned(),
    };
    SessionAnalysis {
        record,
        validation,
        extrapolated,
    }
}

/// Write samples as CSV with an `x,y,timestamp,confidence` header.
pub fn write_csv<W: Write>(writer: W, samples: &[GazeSample]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for sample in samples {
        wtr.serialize(sample)?;
    }
    wtr.flush()?;
    Ok(())
}
