//! Eye geometry derived from facial landmarks.
//!
//! All coordinates live in source-image pixel space with y growing downward.

use crate::error::{Eye, VisionError};

/// Native pixel size of the overlay asset the transforms are calibrated for.
pub const OVERLAY_WIDTH: u32 = 150;
pub const OVERLAY_HEIGHT: u32 = 80;

/// Overlay width relative to the horizontal eye distance.
pub const SCALE_FACTOR: f32 = 2.7;

/// Index ranges of the eye contours in the 68-point (iBUG) layout.
const LEFT_EYE_68: std::ops::Range<usize> = 36..42;
const RIGHT_EYE_68: std::ops::Range<usize> = 42..48;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Eye contours of one detected face.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LandmarkSet {
    left_eye: Vec<Point>,
    right_eye: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(left_eye: Vec<Point>, right_eye: Vec<Point>) -> Self {
        Self {
            left_eye,
            right_eye,
        }
    }

    /// Build from a full 68-point landmark layout.
    pub fn from_68(points: &[Point]) -> Result<Self, VisionError> {
        let short = if points.len() < LEFT_EYE_68.end {
            Some(Eye::Left)
        } else if points.len() < RIGHT_EYE_68.end {
            Some(Eye::Right)
        } else {
            None
        };
        if let Some(eye) = short {
            return Err(VisionError::invalid_landmarks(
                eye,
                "68-point layout is truncated",
            ));
        }
        Ok(Self {
            left_eye: points[LEFT_EYE_68].to_vec(),
            right_eye: points[RIGHT_EYE_68].to_vec(),
        })
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.left_eye
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.right_eye
    }

    pub fn eye_centers(&self) -> Result<(Point, Point), VisionError> {
        Ok((
            eye_center(&self.left_eye, Eye::Left)?,
            eye_center(&self.right_eye, Eye::Right)?,
        ))
    }
}

/// Ordered landmark sets, one per detected face, in detector order.
pub type DetectionResult = Vec<LandmarkSet>;

/// Arithmetic mean of an eye contour.
pub fn eye_center(points: &[Point], eye: Eye) -> Result<Point, VisionError> {
    if points.is_empty() {
        return Err(VisionError::invalid_landmarks(eye, "eye contour is empty"));
    }
    if !points.iter().all(Point::is_finite) {
        return Err(VisionError::invalid_landmarks(
            eye,
            "eye contour has non-finite coordinates",
        ));
    }

    let n = points.len() as f32;
    let x = points.iter().map(|p| p.x).sum::<f32>() / n;
    let y = points.iter().map(|p| p.y).sum::<f32>() / n;
    Ok(Point { x, y })
}

/// Placement of the overlay for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayTransform {
    /// Overlay center before rotation; also the rotation pivot.
    pub anchor: Point,
    pub width: f32,
    pub height: f32,
    pub angle_radians: f32,
}

impl OverlayTransform {
    pub fn from_landmarks(landmarks: &LandmarkSet) -> Result<Self, VisionError> {
        let (left, right) = landmarks.eye_centers()?;
        Ok(Self::from_eye_centers(left, right))
    }

    /// The overlay is centered on the left eye, not the eye midpoint; the
    /// scale factor is tuned together with that anchor.
    pub fn from_eye_centers(left: Point, right: Point) -> Self {
        let dx = right.x - left.x;
        let dy = right.y - left.y;

        let width = dx.abs() * SCALE_FACTOR;
        let height = width * (OVERLAY_HEIGHT as f32 / OVERLAY_WIDTH as f32);

        Self {
            anchor: left,
            width,
            height,
            angle_radians: dy.atan2(dx),
        }
    }
}
