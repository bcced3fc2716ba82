use glam::Vec2;
use image::{GrayImage, Luma};
use imageproc::{
    contours::{BorderType, find_contours},
    drawing::{draw_filled_rect_mut, draw_polygon_mut},
    point::Point,
    rect::Rect,
};

use crate::{analysis::bbox::Bbox, consts::MASK_THRESHOLD};

/// A single-region segmentation mask covering the whole source image.
///
/// Pixels strictly above [`MASK_THRESHOLD`] belong to the region.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    image: GrayImage,
}

impl Mask {
    pub fn new(image: GrayImage) -> Self {
        Self { image }
    }

    /// Rasterizes a closed polygon given in pixel coordinates.
    ///
    /// Polygons with fewer than three distinct points produce an empty mask.
    pub fn from_polygon(width: u32, height: u32, polygon: &[Vec2]) -> Self {
        let mut image = GrayImage::new(width, height);
        let mut points: Vec<Point<i32>> = polygon
            .iter()
            .map(|p| Point::new(p.x.round() as i32, p.y.round() as i32))
            .collect();
        points.dedup();
        while points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() >= 3 {
            draw_polygon_mut(&mut image, &points, Luma([255u8]));
        }
        Self { image }
    }

    /// Fills the whole box, used when the model only reports a rectangle.
    pub fn from_bbox(width: u32, height: u32, bbox: &Bbox) -> Self {
        let mut image = GrayImage::new(width, height);
        if let Some(bbox) = bbox.clamped(width, height) {
            let rect = Rect::at(bbox.min.x.floor() as i32, bbox.min.y.floor() as i32).of_size(
                (bbox.width().ceil() as u32).max(1),
                (bbox.height().ceil() as u32).max(1),
            );
            draw_filled_rect_mut(&mut image, rect, Luma([255u8]));
        }
        Self { image }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        x < self.image.width()
            && y < self.image.height()
            && self.image.get_pixel(x, y)[0] > MASK_THRESHOLD
    }

    /// Number of foreground pixels.
    pub fn area(&self) -> u32 {
        self.image
            .pixels()
            .filter(|pixel| pixel[0] > MASK_THRESHOLD)
            .count() as u32
    }

    /// Bounding extent of the foreground, with each pixel covering a unit square.
    pub fn extent(&self) -> Option<Bbox> {
        let mut min = (u32::MAX, u32::MAX);
        let mut max = (0u32, 0u32);
        let mut found = false;

        for (x, y, pixel) in self.image.enumerate_pixels() {
            if pixel[0] > MASK_THRESHOLD {
                found = true;
                min = (min.0.min(x), min.1.min(y));
                max = (max.0.max(x), max.1.max(y));
            }
        }

        found.then(|| {
            Bbox::new(
                Vec2::new(min.0 as f32, min.1 as f32),
                Vec2::new((max.0 + 1) as f32, (max.1 + 1) as f32),
            )
        })
    }

    /// Binary copy with foreground at 255, as expected by contour tracing.
    pub fn binary(&self) -> GrayImage {
        let mut binary = self.image.clone();
        for pixel in binary.pixels_mut() {
            pixel[0] = if pixel[0] > MASK_THRESHOLD { 255 } else { 0 };
        }
        binary
    }

    /// The longest outer border of the mask.
    pub fn outer_contour(&self) -> Option<Vec<Point<i32>>> {
        find_contours::<i32>(&self.binary())
            .into_iter()
            .filter(|contour| contour.border_type == BorderType::Outer)
            .map(|contour| contour.points)
            .max_by_key(|points| points.len())
    }

    /// Foreground pixels projecting onto the first and the last `fraction`
    /// of the segment `a -> b`.
    ///
    /// Arrow heads are wider than shafts, so the end carrying more mass is
    /// the head.
    pub fn end_mass(&self, a: Vec2, b: Vec2, fraction: f32) -> (u32, u32) {
        let axis = b - a;
        let length_sq = axis.length_squared();
        let Some(extent) = self.extent().filter(|_| length_sq > 0.0) else {
            return (0, 0);
        };

        let (mut near_a, mut near_b) = (0, 0);
        for y in extent.min.y as u32..extent.max.y as u32 {
            for x in extent.min.x as u32..extent.max.x as u32 {
                if !self.is_set(x, y) {
                    continue;
                }
                let point = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let t = (point - a).dot(axis) / length_sq;
                if t <= fraction {
                    near_a += 1;
                } else if t >= 1.0 - fraction {
                    near_b += 1;
                }
            }
        }
        (near_a, near_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_extent_and_area() {
        let mask = Mask::from_bbox(50, 40, &Bbox::from_xywh(10.0, 5.0, 20.0, 10.0));
        assert_eq!(mask.area(), 200); // 20 * 10
        assert_eq!(mask.extent(), Some(Bbox::from_xywh(10.0, 5.0, 20.0, 10.0)));
        assert!(mask.is_set(10, 5));
        assert!(!mask.is_set(30, 5));
        assert!(!mask.is_set(500, 500));
    }

    #[test]
    fn test_empty_mask() {
        let mask = Mask::new(GrayImage::new(10, 10));
        assert_eq!(mask.area(), 0);
        assert!(mask.extent().is_none());
        assert!(mask.outer_contour().is_none());
    }

    #[test]
    fn test_threshold_applies() {
        let mut image = GrayImage::new(8, 8);
        image.put_pixel(2, 2, Luma([MASK_THRESHOLD]));
        image.put_pixel(3, 3, Luma([MASK_THRESHOLD + 1]));
        let mask = Mask::new(image);
        assert_eq!(mask.area(), 1);
        assert_eq!(mask.extent(), Some(Bbox::from_xywh(3.0, 3.0, 1.0, 1.0)));
    }

    #[test]
    fn test_degenerate_polygon_is_empty() {
        let line = [Vec2::new(0.0, 0.0), Vec2::new(10.0, 10.0), Vec2::new(0.0, 0.0)];
        assert_eq!(Mask::from_polygon(20, 20, &line).area(), 0);
    }

    #[test]
    fn test_polygon_contour() {
        let square = [
            Vec2::new(4.0, 4.0),
            Vec2::new(24.0, 4.0),
            Vec2::new(24.0, 24.0),
            Vec2::new(4.0, 24.0),
        ];
        let mask = Mask::from_polygon(32, 32, &square);
        let extent = mask.extent().unwrap();
        assert_eq!(extent.min, Vec2::new(4.0, 4.0));
        // Rasterized edges are inclusive, so the far side lands on 24 or 25
        assert!(extent.max.x >= 24.0 && extent.max.x <= 25.0);
        assert!(extent.max.y >= 24.0 && extent.max.y <= 25.0);
        assert!(mask.outer_contour().unwrap().len() >= 4);
    }

    #[test]
    fn test_end_mass() {
        // 40px long bar, 4px tall, with a 10x12 block at its right end
        let mut mask = Mask::from_bbox(64, 32, &Bbox::from_xywh(0.0, 10.0, 40.0, 4.0)).binary();
        draw_filled_rect_mut(&mut mask, Rect::at(30, 6).of_size(10, 12), Luma([255u8]));
        let mask = Mask::new(mask);

        let (left, right) = mask.end_mass(Vec2::new(0.0, 12.0), Vec2::new(40.0, 12.0), 0.25);
        // Left quarter: 10 x 4 of shaft
        assert_eq!(left, 40);
        // Right quarter: 10 x 12 block
        assert_eq!(right, 120);

        assert_eq!(mask.end_mass(Vec2::ONE, Vec2::ONE, 0.25), (0, 0));
    }
}
