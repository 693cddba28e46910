use super::GazeSample;
use serde::{Deserialize, Serialize};

/// How predictions are smoothed before they reach the engine's buffers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Smoothing {
    /// Predictions pass through untouched
    Raw,
    /// The model's built-in Kalman filter smooths its own output
    Filtered,
    /// Exponential moving average applied by the engine
    Exponential { alpha: f64 },
}

impl Default for Smoothing {
    fn default() -> Self {
        Smoothing::Filtered
    }
}

impl Smoothing {
    /// Whether the model should run its own output filter.
    pub fn uses_model_filter(&self) -> bool {
        matches!(self, Smoothing::Filtered)
    }
}

/// EMA over sample positions. Confidence and timestamps are left alone.
#[derive(Debug, Clone)]
pub struct GazeSmoother {
    /// 0 = maximum smoothing, 1 = none
    alpha: Option<f64>,
    last: Option<(f64, f64)>,
}

impl GazeSmoother {
    pub fn new(smoothing: Smoothing) -> Self {
        let alpha = match smoothing {
            Smoothing::Exponential { alpha } => Some(alpha.clamp(0.0, 1.0)),
            Smoothing::Raw | Smoothing::Filtered => None,
        };
        Self { alpha, last: None }
    }

    pub fn smooth(&mut self, sample: GazeSample) -> GazeSample {
        let Some(alpha) = self.alpha else {
            return sample;
        };
        let (x, y) = match self.last {
            Some((lx, ly)) => (
                alpha * sample.x + (1.0 - alpha) * lx,
                alpha * sample.y + (1.0 - alpha) * ly,
            ),
            None => (sample.x, sample.y),
        };
        self.last = Some((x, y));
        GazeSample { x, y, ..sample }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_and_filtered_pass_through() {
        for mode in [Smoothing::Raw, Smoothing::Filtered] {
            let mut s = GazeSmoother::new(mode);
            let a = GazeSample::new(10.0, 20.0, 0, 0.5);
            let b = GazeSample::new(100.0, 200.0, 1, 0.5);
            assert_eq!(s.smooth(a), a);
            assert_eq!(s.smooth(b), b);
        }
    }

    #[test]
    fn exponential_blends_toward_new_sample() {
        let mut s = GazeSmoother::new(Smoothing::Exponential { alpha: 0.5 });
        s.smooth(GazeSample::new(0.0, 0.0, 0, 0.5));
        let out = s.smooth(GazeSample::new(100.0, 50.0, 1, 0.7));
        assert_eq!((out.x, out.y), (50.0, 25.0));
        assert_eq!(out.confidence, 0.7);

        s.reset();
        let fresh = s.smooth(GazeSample::new(8.0, 8.0, 2, 0.7));
        assert_eq!((fresh.x, fresh.y), (8.0, 8.0));
    }

    #[test]
    fn only_filtered_uses_model_filter() {
        assert!(Smoothing::Filtered.uses_model_filter());
        assert!(!Smoothing::Raw.uses_model_filter());
        assert!(!Smoothing::Exponential { alpha: 0.3 }.uses_model_filter());
    }
}
