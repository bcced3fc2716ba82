use glam::Vec2;
use serde::{Deserialize, Serialize};

/// An axis-aligned box in image pixel space.
///
/// Stored as `min`/`max` corners with y growing downward, exposed to the
/// document layer as `(x, y, width, height)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    /// The top-left corner.
    pub min: Vec2,
    /// The bottom-right corner.
    pub max: Vec2,
}

impl Bbox {
    /// Creates a box from its two corners.
    ///
    /// # Example
    /// ```
    /// use glam::Vec2;
    /// use ferrdiag_core::analysis::bbox::Bbox;
    /// let bbox = Bbox::new(Vec2::new(0.0, 0.0), Vec2::new(10.0, 5.0));
    /// assert_eq!(bbox.width(), 10.0);
    /// ```
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Creates a box from `(x, y, width, height)`.
    ///
    /// # Example
    /// ```
    /// use ferrdiag_core::analysis::bbox::Bbox;
    /// let bbox = Bbox::from_xywh(4.0, 8.0, 20.0, 10.0);
    /// assert_eq!(bbox.max.x, 24.0);
    /// assert_eq!(bbox.max.y, 18.0);
    /// ```
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        let min = Vec2::new(x, y);
        Self {
            min,
            max: min + Vec2::new(width, height),
        }
    }

    /// Clamps the box to an image of `width` x `height` pixels.
    ///
    /// Returns `None` when any coordinate is not finite or the clamped box has
    /// no area, so every box that comes out of here satisfies the document
    /// invariants.
    ///
    /// # Example
    /// ```
    /// use glam::Vec2;
    /// use ferrdiag_core::analysis::bbox::Bbox;
    /// let bbox = Bbox::new(Vec2::new(-5.0, 10.0), Vec2::new(120.0, 40.0));
    /// let clamped = bbox.clamped(100, 100).unwrap();
    /// assert_eq!(clamped.min, Vec2::new(0.0, 10.0));
    /// assert_eq!(clamped.max, Vec2::new(100.0, 40.0));
    ///
    /// let outside = Bbox::new(Vec2::new(150.0, 0.0), Vec2::new(160.0, 10.0));
    /// assert!(outside.clamped(100, 100).is_none());
    /// ```
    pub fn clamped(&self, width: u32, height: u32) -> Option<Self> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return None;
        }
        let clamped = self.clamp(Vec2::ZERO, Vec2::new(width as f32, height as f32));
        clamped.is_valid().then_some(clamped)
    }

    /// `true` when every coordinate is finite and the box has positive size.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.max.x > self.min.x
            && self.max.y > self.min.y
    }

    pub fn x(&self) -> f32 {
        self.min.x
    }

    pub fn y(&self) -> f32 {
        self.min.y
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    /// Calculates the area of the box (width × height).
    pub fn area(&self) -> f32 {
        let length = self.max - self.min;

        length.x * length.y
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) / 2.0
    }

    /// Calculates the area shared with `other`, or 0.0 when they are disjoint.
    ///
    /// # Example
    /// ```
    /// use glam::Vec2;
    /// use ferrdiag_core::analysis::bbox::Bbox;
    /// let bbox1 = Bbox::new(Vec2::new(0.0, 0.0), Vec2::new(4.0, 4.0));
    /// let bbox2 = Bbox::new(Vec2::new(2.0, 2.0), Vec2::new(6.0, 6.0));
    /// assert_eq!(bbox1.intersection(&bbox2), 4.0); // 2x2 intersection area
    /// ```
    pub fn intersection(&self, other: &Self) -> f32 {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);

        if max.x > min.x && max.y > min.y {
            (max.x - min.x) * (max.y - min.y)
        } else {
            0.
        }
    }

    /// Calculates the Intersection over Union (IoU) with `other`.
    ///
    /// # Formula
    /// IoU = Intersection Area / (Area1 + Area2 - Intersection Area)
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection_area = self.intersection(other);
        let union_area = self.area() + other.area() - intersection_area;

        if union_area > 0.0 {
            intersection_area / union_area
        } else {
            0.0
        }
    }

    /// Clamps the box coordinates to the given bounds.
    pub fn clamp(&self, min_bounds: Vec2, max_bounds: Vec2) -> Self {
        Self {
            min: self.min.max(min_bounds).min(max_bounds),
            max: self.max.min(max_bounds).max(min_bounds),
        }
    }

    pub fn contains_point(&self, point: Vec2) -> bool {
        point.x >= self.min.x
            && point.y >= self.min.y
            && point.x <= self.max.x
            && point.y <= self.max.y
    }

    /// Grows the box by `fraction` of its size on every side.
    ///
    /// The result is not clamped, callers clamp against the image.
    ///
    /// # Example
    /// ```
    /// use ferrdiag_core::analysis::bbox::Bbox;
    /// let bbox = Bbox::from_xywh(10.0, 10.0, 20.0, 10.0);
    /// let grown = bbox.expand(0.5);
    /// assert_eq!(grown, Bbox::from_xywh(0.0, 5.0, 40.0, 20.0));
    /// ```
    pub fn expand(&self, fraction: f32) -> Self {
        let margin = (self.max - self.min) * fraction;
        Self {
            min: self.min - margin,
            max: self.max + margin,
        }
    }

    /// Rounds both corners to the nearest 1/64 px.
    ///
    /// Coordinates on this grid survive conversion to `(x, y, width, height)`
    /// and back without rounding error.
    ///
    /// # Example
    /// ```
    /// use ferrdiag_core::analysis::bbox::Bbox;
    /// let bbox = Bbox::from_xywh(0.1, 10.0, 20.3, 5.0).snapped();
    /// assert_eq!(bbox, Bbox::from_xywh(bbox.x(), bbox.y(), bbox.width(), bbox.height()));
    /// ```
    pub fn snapped(&self) -> Self {
        const GRID: f32 = 64.0;
        Self {
            min: (self.min * GRID).round() / GRID,
            max: (self.max * GRID).round() / GRID,
        }
    }

    /// Euclidean distance from `point` to the nearest point of the box.
    ///
    /// Zero when the point lies inside.
    pub fn distance_to_point(&self, point: Vec2) -> f32 {
        let nearest = point.clamp(self.min, self.max);
        nearest.distance(point)
    }
}
