use super::{Point, Viewport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Grid positions along each axis, as fractions of the usable span
const GRID_FRACTIONS: [f64; 3] = [0.0, 0.5, 1.0];

/// One clickable calibration target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTarget {
    pub index: usize,
    pub position: Point,
    pub clicks: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownPoint,
    AlreadyComplete,
    /// Same point confirmed twice in a row while others are still open
    RepeatedPoint,
    NotCalibrating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    Accepted { index: usize, remaining: u32 },
    PointComplete { index: usize },
    CalibrationComplete,
    Rejected(RejectReason),
}

/// 3x3 grid of targets inset `margin` pixels from the viewport edges.
pub fn nine_point_grid(viewport: Viewport, margin: f64) -> Vec<Point> {
    let usable_w = (viewport.width - 2.0 * margin).max(0.0);
    let usable_h = (viewport.height - 2.0 * margin).max(0.0);
    GRID_FRACTIONS
        .iter()
        .flat_map(|fy| {
            GRID_FRACTIONS
                .iter()
                .map(move |fx| Point::new(margin + fx * usable_w, margin + fy * usable_h))
        })
        .collect()
}

/// Click bookkeeping for a supervised calibration.
///
/// The model learns from the clicks themselves; this only decides which
/// clicks count toward completing a target.
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    targets: Vec<CalibrationTarget>,
    clicks_required: u32,
    last_confirmed: Option<usize>,
}

impl CalibrationSession {
    pub fn new(points: Vec<Point>, clicks_required: u32) -> Self {
        let targets = points
            .into_iter()
            .enumerate()
            .map(|(index, position)| CalibrationTarget {
                index,
                position,
                clicks: 0,
                complete: false,
            })
            .collect();
        Self {
            targets,
            clicks_required: clicks_required.max(1),
            last_confirmed: None,
        }
    }

    pub fn nine_point(viewport: Viewport, margin: f64, clicks_required: u32) -> Self {
        let session = Self::new(nine_point_grid(viewport, margin), clicks_required);
        info!(
            "calibration started: {} targets, {} clicks each",
            session.targets.len(),
            session.clicks_required
        );
        session
    }

    pub fn targets(&self) -> &[CalibrationTarget] {
        &self.targets
    }

    pub fn clicks_required(&self) -> u32 {
        self.clicks_required
    }

    pub fn incomplete(&self) -> usize {
        self.targets.iter().filter(|t| !t.complete).count()
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete() == 0
    }

    pub fn progress(&self) -> f64 {
        if self.targets.is_empty() {
            return 1.0;
        }
        (self.targets.len() - self.incomplete()) as f64 / self.targets.len() as f64
    }

    pub fn confirm(&mut self, index: usize) -> ClickOutcome {
        let incomplete = self.incomplete();
        let Some(target) = self.targets.get(index) else {
            return ClickOutcome::Rejected(RejectReason::UnknownPoint);
        };
        if target.complete {
            return ClickOutcome::Rejected(RejectReason::AlreadyComplete);
        }
        if self.last_confirmed == Some(index) && incomplete > 1 {
            debug!("calibration point {} clicked twice in a row, ignored", index);
            return ClickOutcome::Rejected(RejectReason::RepeatedPoint);
        }

        let required = self.clicks_required;
        let target = &mut self.targets[index];
        target.clicks += 1;
        self.last_confirmed = Some(index);
        if target.clicks < required {
            return ClickOutcome::Accepted {
                index,
                remaining: required - target.clicks,
            };
        }

        target.complete = true;
        if self.is_complete() {
            info!("all calibration points confirmed");
            ClickOutcome::CalibrationComplete
        } else {
            ClickOutcome::PointComplete { index }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_corners_respect_margin() {
        let grid = nine_point_grid(Viewport::new(1000.0, 600.0), 50.0);
        assert_eq!(grid.len(), 9);
        assert_eq!(grid[0], Point::new(50.0, 50.0));
        assert_eq!(grid[4], Point::new(500.0, 300.0));
        assert_eq!(grid[8], Point::new(950.0, 550.0));
    }

    #[test]
    fn same_point_twice_in_a_row_is_rejected() {
        let mut s = CalibrationSession::new(nine_point_grid(Viewport::new(800.0, 600.0), 20.0), 5);
        assert_eq!(
            s.confirm(0),
            ClickOutcome::Accepted {
                index: 0,
                remaining: 4
            }
        );
        assert_eq!(
            s.confirm(0),
            ClickOutcome::Rejected(RejectReason::RepeatedPoint)
        );
        assert!(matches!(s.confirm(1), ClickOutcome::Accepted { .. }));
        assert!(matches!(s.confirm(0), ClickOutcome::Accepted { .. }));
        assert_eq!(s.targets()[0].clicks, 2);
    }

    #[test]
    fn last_point_may_be_repeated() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(20.0, 20.0),
        ];
        let mut s = CalibrationSession::new(points, 4);
        for i in [0, 1, 0, 2, 0, 1] {
            assert!(matches!(s.confirm(i), ClickOutcome::Accepted { .. }));
        }
        assert_eq!(s.confirm(0), ClickOutcome::PointComplete { index: 0 });
        assert_eq!(
            s.confirm(0),
            ClickOutcome::Rejected(RejectReason::AlreadyComplete)
        );
        assert!(matches!(s.confirm(1), ClickOutcome::Accepted { .. }));
        assert!(matches!(s.confirm(2), ClickOutcome::Accepted { .. }));
        assert_eq!(s.confirm(1), ClickOutcome::PointComplete { index: 1 });
        // point 2 is the only one left, consecutive clicks count
        assert_eq!(
            s.confirm(2),
            ClickOutcome::Accepted {
                index: 2,
                remaining: 1
            }
        );
        assert_eq!(s.confirm(2), ClickOutcome::CalibrationComplete);
        assert!(s.is_complete());
    }

    #[test]
    fn full_round_robin_completes() {
        let mut s = CalibrationSession::nine_point(Viewport::new(1280.0, 720.0), 40.0, 5);
        let mut last = ClickOutcome::Rejected(RejectReason::NotCalibrating);
        for _ in 0..5 {
            for i in 0..9 {
                last = s.confirm(i);
            }
        }
        assert_eq!(last, ClickOutcome::CalibrationComplete);
        assert_eq!(s.progress(), 1.0);
    }

    #[test]
    fn unknown_point_is_rejected() {
        let mut s = CalibrationSession::nine_point(Viewport::new(100.0, 100.0), 0.0, 1);
        assert_eq!(s.confirm(42), ClickOutcome::Rejected(RejectReason::UnknownPoint));
    }
}
