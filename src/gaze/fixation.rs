//! Dispersion-threshold (I-DT) fixation detection over a tracking session.

use super::mapping::compute_domain;
use super::{GazeSample, Point};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixationParams {
    /// Largest x-range + y-range a fixation window may span, in px
    pub max_dispersion: f64,
    pub min_duration_ms: i64,
}

impl Default for FixationParams {
    fn default() -> Self {
        Self {
            max_dispersion: 50.0,
            min_duration_ms: 100,
        }
    }
}

/// A run of samples that stayed within the dispersion threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixationPoint {
    pub x: f64,
    pub y: f64,
    pub start: i64,
    pub duration_ms: i64,
    pub sample_count: usize,
}

fn dispersion(window: &[GazeSample]) -> f64 {
    compute_domain(window).map_or(0.0, |d| d.width() + d.height())
}

/// Detect fixations in time-ordered samples.
pub fn detect_fixations(samples: &[GazeSample], params: FixationParams) -> Vec<FixationPoint> {
    let mut fixations = Vec::new();
    let mut start = 0;

    while start < samples.len() {
        // smallest window covering the minimum duration
        let first_ts = samples[start].timestamp;
        let Some(mut end) = samples[start..]
            .iter()
            .position(|s| s.timestamp - first_ts >= params.min_duration_ms)
            .map(|offset| start + offset)
        else {
            break;
        };

        if dispersion(&samples[start..=end]) > params.max_dispersion {
            start += 1;
            continue;
        }
        while end + 1 < samples.len()
            && dispersion(&samples[start..=end + 1]) <= params.max_dispersion
        {
            end += 1;
        }

        let window = &samples[start..=end];
        let n = window.len() as f64;
        fixations.push(FixationPoint {
            x: window.iter().map(|s| s.x).sum::<f64>() / n,
            y: window.iter().map(|s| s.y).sum::<f64>() / n,
            start: first_ts,
            duration_ms: window[window.len() - 1].timestamp - first_ts,
            sample_count: window.len(),
        });
        start = end + 1;
    }

    fixations
}

/// Fixation centres in viewing order
pub fn scan_path(fixations: &[FixationPoint]) -> Vec<Point> {
    fixations.iter().map(|f| Point::new(f.x, f.y)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dwell(x: f64, y: f64, from_ms: i64, count: usize) -> Vec<GazeSample> {
        (0..count)
            .map(|i| {
                let wobble = (i % 3) as f64;
                GazeSample::new(x + wobble, y - wobble, from_ms + i as i64 * 50, 0.8)
            })
            .collect()
    }

    #[test]
    fn two_dwells_give_two_fixations() {
        let mut samples = dwell(100.0, 100.0, 0, 6);
        samples.extend(dwell(600.0, 400.0, 300, 8));

        let fixations = detect_fixations(&samples, FixationParams::default());
        assert_eq!(fixations.len(), 2);
        assert_eq!(fixations[0].sample_count, 6);
        assert_eq!(fixations[0].start, 0);
        assert_eq!(fixations[0].duration_ms, 250);
        assert!((fixations[0].x - 101.0).abs() < 1.0);
        assert_eq!(fixations[1].start, 300);
        assert_eq!(fixations[1].sample_count, 8);

        let path = scan_path(&fixations);
        assert_eq!(path.len(), 2);
        assert!(path[1].x > 590.0);
    }

    #[test]
    fn saccade_samples_are_not_fixations() {
        let samples: Vec<_> = (0..10)
            .map(|i| GazeSample::new(i as f64 * 100.0, 0.0, i * 50, 0.8))
            .collect();
        assert!(detect_fixations(&samples, FixationParams::default()).is_empty());
    }

    #[test]
    fn too_short_dwell_is_ignored() {
        // 2 samples 50ms apart never reach the 100ms minimum
        let samples = dwell(10.0, 10.0, 0, 2);
        assert!(detect_fixations(&samples, FixationParams::default()).is_empty());
        assert!(detect_fixations(&[], FixationParams::default()).is_empty());
    }
}
