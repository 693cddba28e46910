use super::{GazeSample, Point, Viewport};
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fraction of the viewport gaze may extrapolate past each edge.
pub const VIEWPORT_MARGIN: f64 = 0.2;

/// Floor on the confidence of a sample sitting at an image's center.
pub const CENTER_CONFIDENCE: f64 = 0.3;

/// Bounding box of the gaze samples seen during calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDomain {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl CalibrationDomain {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Position of `p` relative to the domain, 0..1 inside it.
    fn normalize(&self, p: Point) -> (f64, f64) {
        (
            (p.x - self.min_x) / span(self.width()),
            (p.y - self.min_y) / span(self.height()),
        )
    }
}

// zero-width domains collapse to span 1 instead of dividing by zero
fn span(extent: f64) -> f64 {
    if extent == 0.0 || !extent.is_finite() {
        1.0
    } else {
        extent
    }
}

/// On-screen rectangle of a displayed image and its natural pixel size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageBounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub natural_width: f64,
    pub natural_height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMapping {
    pub point: Point,
    /// The raw point lay outside the calibration domain
    pub extrapolated: bool,
}

pub fn compute_domain(samples: &[GazeSample]) -> Option<CalibrationDomain> {
    let (min_x, max_x) = bounds(samples.iter().map(|s| s.x))?;
    let (min_y, max_y) = bounds(samples.iter().map(|s| s.y))?;
    Some(CalibrationDomain {
        min_x,
        max_x,
        min_y,
        max_y,
    })
}

fn bounds(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    match values.minmax() {
        MinMaxResult::NoElements => None,
        MinMaxResult::OneElement(v) => Some((v, v)),
        MinMaxResult::MinMax(lo, hi) => Some((lo, hi)),
    }
}

/// Stretch `point` from `domain` onto a `width` x `height` target, clamping
/// anything outside the domain to its edge.
pub fn map_from_domain(point: Point, domain: &CalibrationDomain, width: f64, height: f64) -> Point {
    let (nx, ny) = domain.normalize(point);
    Point::new(nx.clamp(0.0, 1.0) * width, ny.clamp(0.0, 1.0) * height)
}

/// Map a raw model prediction onto the viewport.
///
/// Points outside the calibration domain extrapolate linearly, then are
/// held within the viewport grown by [`VIEWPORT_MARGIN`] on every side.
/// Without a domain the viewport center is returned.
pub fn map_to_viewport(
    point: Point,
    domain: Option<&CalibrationDomain>,
    viewport: Viewport,
) -> ViewportMapping {
    let Some(domain) = domain else {
        return ViewportMapping {
            point: viewport.center(),
            extrapolated: false,
        };
    };

    let (nx, ny) = domain.normalize(point);
    let extrapolated = !(0.0..=1.0).contains(&nx) || !(0.0..=1.0).contains(&ny);
    if extrapolated {
        debug!(
            "gaze ({:.1}, {:.1}) outside calibration domain, normalized ({:.2}, {:.2})",
            point.x, point.y, nx, ny
        );
    }

    let mx = viewport.width * VIEWPORT_MARGIN;
    let my = viewport.height * VIEWPORT_MARGIN;
    ViewportMapping {
        point: Point::new(
            (nx * viewport.width).clamp(-mx, viewport.width + mx),
            (ny * viewport.height).clamp(-my, viewport.height + my),
        ),
        extrapolated,
    }
}

/// Project a viewport sample into the image's natural pixel space.
///
/// Positions outside the displayed rectangle land proportionally outside
/// the natural bounds. Confidence is raised toward
/// `CENTER_CONFIDENCE * closeness`, where closeness falls linearly from 1 at
/// the image center to 0 at a half-diagonal away; it is never lowered.
pub fn map_to_image_coordinates(sample: &GazeSample, bounds: &ImageBounds) -> GazeSample {
    let rel_x = (sample.x - bounds.left) / span(bounds.width);
    let rel_y = (sample.y - bounds.top) / span(bounds.height);

    let cx = bounds.left + bounds.width / 2.0;
    let cy = bounds.top + bounds.height / 2.0;
    let half_diagonal = (bounds.width / 2.0).hypot(bounds.height / 2.0);
    let closeness = if half_diagonal > 0.0 {
        (1.0 - (sample.x - cx).hypot(sample.y - cy) / half_diagonal).max(0.0)
    } else {
        0.0
    };

    GazeSample {
        x: rel_x * bounds.natural_width,
        y: rel_y * bounds.natural_height,
        timestamp: sample.timestamp,
        confidence: sample.confidence.max(CENTER_CONFIDENCE * closeness),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> CalibrationDomain {
        CalibrationDomain {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    #[test]
    fn domain_of_empty_is_none() {
        assert_eq!(compute_domain(&[]), None);
    }

    #[test]
    fn domain_is_bounding_box() {
        let samples = [
            GazeSample::new(10.0, 40.0, 0, 0.5),
            GazeSample::new(-5.0, 90.0, 1, 0.5),
            GazeSample::new(30.0, 20.0, 2, 0.5),
        ];
        assert_eq!(compute_domain(&samples), Some(domain(-5.0, 30.0, 20.0, 90.0)));
        assert_eq!(
            compute_domain(&samples[..1]),
            Some(domain(10.0, 10.0, 40.0, 40.0))
        );
    }

    #[test]
    fn midpoint_maps_to_midpoint() {
        let d = domain(0.0, 100.0, 0.0, 50.0);
        assert_eq!(
            map_from_domain(Point::new(50.0, 25.0), &d, 200.0, 100.0),
            Point::new(100.0, 50.0)
        );
    }

    #[test]
    fn below_domain_clamps_to_zero() {
        let d = domain(0.0, 100.0, 0.0, 50.0);
        let p = map_from_domain(Point::new(-40.0, -10.0), &d, 200.0, 100.0);
        assert_eq!(p, Point::new(0.0, 0.0));
        let p = map_from_domain(Point::new(400.0, 60.0), &d, 200.0, 100.0);
        assert_eq!(p, Point::new(200.0, 100.0));
    }

    #[test]
    fn degenerate_domain_does_not_divide_by_zero() {
        let d = domain(10.0, 10.0, 5.0, 5.0);
        let p = map_from_domain(Point::new(10.5, 5.25), &d, 200.0, 100.0);
        assert_eq!(p, Point::new(100.0, 25.0));
        assert!(p.x.is_finite() && p.y.is_finite());
    }

    #[test]
    fn viewport_mapping_extrapolates_within_margin() {
        let d = domain(0.0, 100.0, 0.0, 100.0);
        let vp = Viewport::new(1000.0, 500.0);

        let inside = map_to_viewport(Point::new(50.0, 50.0), Some(&d), vp);
        assert_eq!(inside.point, Point::new(500.0, 250.0));
        assert!(!inside.extrapolated);

        let near = map_to_viewport(Point::new(110.0, 50.0), Some(&d), vp);
        assert!(near.extrapolated);
        assert!((near.point.x - 1100.0).abs() < 1e-9);

        let runaway = map_to_viewport(Point::new(900.0, -300.0), Some(&d), vp);
        assert!(runaway.extrapolated);
        assert_eq!(runaway.point, Point::new(1200.0, -100.0));
    }

    #[test]
    fn viewport_mapping_without_domain_is_center() {
        let m = map_to_viewport(Point::new(3.0, 4.0), None, Viewport::new(800.0, 600.0));
        assert_eq!(m.point, Point::new(400.0, 300.0));
    }

    #[test]
    fn image_mapping_scales_to_natural_size() {
        let bounds = ImageBounds {
            left: 100.0,
            top: 50.0,
            width: 400.0,
            height: 200.0,
            natural_width: 4000.0,
            natural_height: 2000.0,
        };
        let s = map_to_image_coordinates(&GazeSample::new(200.0, 100.0, 7, 0.9), &bounds);
        assert_eq!((s.x, s.y, s.timestamp), (1000.0, 500.0, 7));
        assert_eq!(s.confidence, 0.9);

        // left of the image maps to negative natural x
        let outside = map_to_image_coordinates(&GazeSample::new(0.0, 150.0, 0, 0.5), &bounds);
        assert_eq!(outside.x, -1000.0);
    }

    #[test]
    fn image_mapping_boosts_central_confidence() {
        let bounds = ImageBounds {
            left: 0.0,
            top: 0.0,
            width: 300.0,
            height: 400.0,
            natural_width: 300.0,
            natural_height: 400.0,
        };
        let center = map_to_image_coordinates(&GazeSample::new(150.0, 200.0, 0, 0.05), &bounds);
        assert!((center.confidence - 0.3).abs() < 1e-9);

        // halfway to the corner: half-diagonal is 250
        let half = map_to_image_coordinates(&GazeSample::new(75.0, 100.0, 0, 0.05), &bounds);
        assert!((half.confidence - 0.15).abs() < 1e-9);

        let corner = map_to_image_coordinates(&GazeSample::new(0.0, 0.0, 0, 0.05), &bounds);
        assert_eq!(corner.confidence, 0.05);

        let confident = map_to_image_coordinates(&GazeSample::new(150.0, 200.0, 0, 0.8), &bounds);
        assert_eq!(confident.confidence, 0.8);
    }
}
