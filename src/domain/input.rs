//! Control disc input mapping
//!
//! Converts a touch position relative to the on-screen control disc into a
//! heading/speed pair for the roll command.

use crate::domain::models::ControlVector;
use crate::error::InputError;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Circular input region defined by its center and radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlDisc {
    center: Point,
    radius: f64,
}

impl ControlDisc {
    pub fn new(center: Point, radius: f64) -> Result<Self, InputError> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(InputError::InvalidRadius(radius));
        }
        Ok(Self { center, radius })
    }

    pub fn center(&self) -> Point {
        self.center
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn distance(&self, point: Point) -> f64 {
        self.center.distance_to(point)
    }

    pub fn contains(&self, point: Point) -> bool {
        self.distance(point) <= self.radius
    }

    /// Angle of the ray from the center through `point`, in radians.
    /// `None` when the point coincides with the center.
    pub fn angle(&self, point: Point) -> Option<f64> {
        let dx = point.x - self.center.x;
        let dy = point.y - self.center.y;
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        Some(dy.atan2(dx))
    }

    /// Keeps `point` inside the disc by projecting outside points onto the
    /// boundary along the ray from the center.
    pub fn clamp(&self, point: Point) -> Point {
        if self.contains(point) {
            return point;
        }
        match self.angle(point) {
            Some(theta) => Point::new(
                self.center.x + self.radius * theta.cos(),
                self.center.y + self.radius * theta.sin(),
            ),
            None => self.center,
        }
    }

    /// Linear speed weight: 0 at the center, 1 at or beyond the boundary.
    pub fn weight(&self, distance: f64) -> f64 {
        distance.clamp(0.0, self.radius) / self.radius
    }
}

/// Builds a vector from a weight in `[0, 1]` and an angle in radians.
pub fn to_control_vector(weight: f64, theta: f64) -> ControlVector {
    ControlVector {
        heading: normalize_degrees(theta.to_degrees()),
        speed: weight.clamp(0.0, 1.0),
        stop: false,
    }
}

fn normalize_degrees(degrees: f64) -> f64 {
    let normalized = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

/// Result of one touch sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchSample {
    /// Where the on-screen indicator should be drawn
    pub indicator: Point,
    pub vector: ControlVector,
}

/// Maps touches on a control disc to control vectors.
///
/// The only state carried between samples is the last heading, which is
/// reused when a touch lands exactly on the center.
#[derive(Debug, Clone)]
pub struct InputMapper {
    disc: ControlDisc,
    last_heading: f64,
}

impl InputMapper {
    pub fn new(disc: ControlDisc) -> Self {
        Self {
            disc,
            last_heading: 0.0,
        }
    }

    pub fn disc(&self) -> &ControlDisc {
        &self.disc
    }

    pub fn touch(&mut self, point: Point) -> TouchSample {
        let indicator = self.disc.clamp(point);
        let distance = self.disc.distance(point);

        let vector = match self.disc.angle(point) {
            Some(theta) => to_control_vector(self.disc.weight(distance), theta),
            None => ControlVector {
                heading: self.last_heading,
                speed: 0.0,
                stop: false,
            },
        };
        self.last_heading = vector.heading;

        TouchSample { indicator, vector }
    }

    /// Touch lifted: indicator snaps back and the ball stops.
    pub fn release(&mut self) -> TouchSample {
        self.last_heading = 0.0;
        TouchSample {
            indicator: self.disc.center(),
            vector: ControlVector::stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn disc() -> ControlDisc {
        ControlDisc::new(Point::new(100.0, 100.0), 50.0).unwrap()
    }

    #[test]
    fn test_touch_beyond_boundary_on_x_axis() {
        let mut mapper = InputMapper::new(disc());
        let sample = mapper.touch(Point::new(200.0, 100.0));

        assert!((sample.vector.heading - 0.0).abs() < EPSILON);
        assert!((sample.vector.speed - 1.0).abs() < EPSILON);
        assert!(!sample.vector.stop);
        assert!((sample.indicator.x - 150.0).abs() < EPSILON);
        assert!((sample.indicator.y - 100.0).abs() < EPSILON);
    }

    #[test]
    fn test_clamped_points_lie_on_boundary() {
        let disc = disc();
        let outside = [
            Point::new(400.0, -30.0),
            Point::new(-250.0, 100.5),
            Point::new(100.0, 151.0),
            Point::new(136.0, 136.0),
            Point::new(-1e6, 1e6),
        ];
        for point in outside {
            assert!(!disc.contains(point));
            let clamped = disc.clamp(point);
            assert!(
                (disc.distance(clamped) - disc.radius()).abs() < 1e-6,
                "{point:?} clamped to {clamped:?}"
            );
        }
    }

    #[test]
    fn test_inside_point_unchanged() {
        let disc = disc();
        let point = Point::new(120.0, 80.0);
        assert_eq!(disc.clamp(point), point);
    }

    #[test]
    fn test_weight_bounds_and_monotonicity() {
        let disc = disc();
        assert_eq!(disc.weight(0.0), 0.0);
        assert_eq!(disc.weight(50.0), 1.0);
        assert_eq!(disc.weight(75.0), 1.0);
        assert_eq!(disc.weight(1e9), 1.0);

        let mut previous = 0.0;
        for step in 0..=200 {
            let w = disc.weight(step as f64 * 0.5);
            assert!(w >= previous);
            previous = w;
        }
    }

    #[test]
    fn test_heading_normalized_to_full_circle() {
        let mut mapper = InputMapper::new(disc());

        // screen y grows downwards, so "up" is 270 degrees
        let up = mapper.touch(Point::new(100.0, 75.0));
        assert!((up.vector.heading - 270.0).abs() < EPSILON);
        assert!((up.vector.speed - 0.5).abs() < EPSILON);

        let left = mapper.touch(Point::new(60.0, 100.0));
        assert!((left.vector.heading - 180.0).abs() < EPSILON);

        let down = mapper.touch(Point::new(100.0, 110.0));
        assert!((down.vector.heading - 90.0).abs() < EPSILON);
    }

    #[test]
    fn test_center_touch_holds_previous_heading() {
        let mut mapper = InputMapper::new(disc());
        mapper.touch(Point::new(100.0, 140.0));

        let centered = mapper.touch(Point::new(100.0, 100.0));
        assert!((centered.vector.heading - 90.0).abs() < EPSILON);
        assert_eq!(centered.vector.speed, 0.0);
        assert_eq!(centered.indicator, Point::new(100.0, 100.0));
    }

    #[test]
    fn test_release_resets_and_stops() {
        let mut mapper = InputMapper::new(disc());
        mapper.touch(Point::new(130.0, 130.0));

        let released = mapper.release();
        assert_eq!(released.vector, ControlVector::stop());
        assert_eq!(released.indicator, Point::new(100.0, 100.0));

        let centered = mapper.touch(Point::new(100.0, 100.0));
        assert_eq!(centered.vector.heading, 0.0);
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let mut a = InputMapper::new(disc());
        let mut b = InputMapper::new(disc());
        let point = Point::new(87.5, 141.25);
        assert_eq!(a.touch(point), b.touch(point));
        assert_eq!(a.touch(point), a.touch(point));
    }

    #[test]
    fn test_invalid_radius_rejected() {
        let center = Point::new(0.0, 0.0);
        assert!(ControlDisc::new(center, 0.0).is_err());
        assert!(ControlDisc::new(center, -5.0).is_err());
        assert!(ControlDisc::new(center, f64::NAN).is_err());
    }

    #[test]
    fn test_negative_angle_wraps() {
        assert!((normalize_degrees(-90.0) - 270.0).abs() < EPSILON);
        assert!(normalize_degrees(-1e-20) < 360.0);
        let v = to_control_vector(2.0, -std::f64::consts::FRAC_PI_2);
        assert!((v.heading - 270.0).abs() < EPSILON);
        assert_eq!(v.speed, 1.0);
    }
}
