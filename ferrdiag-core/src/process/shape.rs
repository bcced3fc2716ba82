use image::GenericImageView;
use imageproc::{
    geometry::{approximate_polygon_dp, arc_length},
    point::Point,
};
use snafu::OptionExt;

use crate::{
    analysis::{bbox::Bbox, labels::Category, mask::Mask},
    consts::POLYGON_EPSILON_FACTOR,
    error::{FerrdiagError, RefinementSnafu},
    layout::element::{Element, Style},
    process::{CategoryProcessor, Scene, hex_color, median_color},
};

/// Minimum IoU between a mask and an ideal outline for the outline to be accepted.
const TEMPLATE_MIN_FIT: f32 = 0.85;

/// Primitive outlines a shape mask is fit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Rectangle,
    Rhombus,
    Ellipse,
    Triangle,
    Pentagon,
    Hexagon,
}

impl ShapeKind {
    /// Rectangle comes first so it wins exact ties.
    const ALL: [ShapeKind; 6] = [
        ShapeKind::Rectangle,
        ShapeKind::Rhombus,
        ShapeKind::Ellipse,
        ShapeKind::Triangle,
        ShapeKind::Pentagon,
        ShapeKind::Hexagon,
    ];

    /// Regular pentagon corners in the unit box, matching the emitted `polyCoords`.
    const PENTAGON: [(f32, f32); 5] = [
        (0.5, 0.0),
        (1.0, 0.38),
        (0.81, 1.0),
        (0.19, 1.0),
        (0.0, 0.38),
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Rhombus => "rhombus",
            ShapeKind::Ellipse => "ellipse",
            ShapeKind::Triangle => "triangle",
            ShapeKind::Pentagon => "pentagon",
            ShapeKind::Hexagon => "hexagon",
        }
    }

    /// Whether `(u, v)`, normalized to the unit box, lies inside the ideal outline.
    fn contains(&self, u: f32, v: f32) -> bool {
        let dx = (2.0 * u - 1.0).abs();
        let dy = (2.0 * v - 1.0).abs();
        match self {
            ShapeKind::Rectangle => true,
            ShapeKind::Rhombus => dx + dy <= 1.0,
            ShapeKind::Ellipse => dx * dx + dy * dy <= 1.0,
            // Apex at the top center, base along the bottom edge
            ShapeKind::Triangle => dx <= v,
            // Pointed left and right, flat top and bottom spanning half the width
            ShapeKind::Hexagon => dx <= 1.0 - 0.5 * dy,
            ShapeKind::Pentagon => inside_convex(u, v, &Self::PENTAGON),
        }
    }

    fn apply(&self, style: &mut Style, bbox: &Bbox) {
        match self {
            ShapeKind::Rectangle => {
                style.set("rounded", "0");
            }
            ShapeKind::Rhombus => {
                style.flag("rhombus");
            }
            ShapeKind::Ellipse => {
                style.flag("ellipse");
                if (bbox.width() - bbox.height()).abs() < 10.0 {
                    style.set("aspect", "fixed");
                }
            }
            ShapeKind::Triangle => {
                style.flag("triangle").set("direction", "north");
            }
            ShapeKind::Pentagon => {
                style
                    .set("shape", "mxgraph.basic.polygon")
                    .set("polyCoords", "[[0.5,0],[1,0.38],[0.81,1],[0.19,1],[0,0.38]]")
                    .set("polyline", "0");
            }
            ShapeKind::Hexagon => {
                style
                    .set("shape", "hexagon")
                    .set("perimeter", "hexagonPerimeter2")
                    .set("size", "0.25");
            }
        }
    }
}

/// Result of fitting a mask to a primitive outline.
#[derive(Debug, Clone)]
pub struct ShapeFit {
    pub kind: ShapeKind,
    /// Agreement between mask and outline in `[0, 1]`.
    pub fit: f32,
    pub contour: Vec<Point<i32>>,
}

/// Fits the mask inside `bbox` to a primitive outline.
///
/// Ideal outlines are scored first by IoU against the mask. If none reaches
/// [`TEMPLATE_MIN_FIT`] the outer contour is simplified and classified by
/// its vertex count.
pub fn fit_shape(mask: &Mask, bbox: &Bbox) -> Option<ShapeFit> {
    let contour = mask.outer_contour().filter(|contour| contour.len() >= 3)?;

    let (mask_width, mask_height) = mask.dimensions();
    let x0 = bbox.min.x.floor().max(0.0) as u32;
    let y0 = bbox.min.y.floor().max(0.0) as u32;
    let x1 = (bbox.max.x.ceil().max(0.0) as u32).min(mask_width);
    let y1 = (bbox.max.y.ceil().max(0.0) as u32).min(mask_height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let (width, height) = ((x1 - x0) as f32, (y1 - y0) as f32);

    let mut best = (ShapeKind::Rectangle, 0.0f32);
    for kind in ShapeKind::ALL {
        let (mut inter, mut union) = (0u32, 0u32);
        for y in y0..y1 {
            for x in x0..x1 {
                let u = (x - x0) as f32 / width + 0.5 / width;
                let v = (y - y0) as f32 / height + 0.5 / height;
                let in_mask = mask.is_set(x, y);
                let in_outline = kind.contains(u, v);
                inter += u32::from(in_mask && in_outline);
                union += u32::from(in_mask || in_outline);
            }
        }
        let fit = if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        };
        if fit > best.1 {
            best = (kind, fit);
        }
    }

    if best.1 >= TEMPLATE_MIN_FIT {
        return Some(ShapeFit {
            kind: best.0,
            fit: best.1,
            contour,
        });
    }

    let epsilon = POLYGON_EPSILON_FACTOR * arc_length(&contour, true);
    let polygon = approximate_polygon_dp(&contour, epsilon, true);
    let (kind, fit) = match polygon.len() {
        3 => (ShapeKind::Triangle, 0.85),
        4 if corners_on_midpoints(&polygon, bbox) => (ShapeKind::Rhombus, 0.85),
        4 => (ShapeKind::Rectangle, 0.9),
        5 => (ShapeKind::Pentagon, 0.8),
        6 => (ShapeKind::Hexagon, 0.8),
        n if n > 6 => (ShapeKind::Ellipse, 0.8),
        _ => (ShapeKind::Rectangle, 0.5),
    };
    Some(ShapeFit {
        kind,
        fit,
        contour,
    })
}

/// Point-in-polygon for a convex polygon given in either winding.
fn inside_convex(u: f32, v: f32, polygon: &[(f32, f32)]) -> bool {
    let mut sign = 0.0f32;
    for (index, &(ax, ay)) in polygon.iter().enumerate() {
        let (bx, by) = polygon[(index + 1) % polygon.len()];
        let cross = (bx - ax) * (v - ay) - (by - ay) * (u - ax);
        if cross != 0.0 {
            if sign != 0.0 && cross.signum() != sign {
                return false;
            }
            sign = cross.signum();
        }
    }
    true
}

/// A quadrilateral whose corners sit on the box's edge midpoints is a rhombus.
fn corners_on_midpoints(polygon: &[Point<i32>], bbox: &Bbox) -> bool {
    let center = bbox.center();
    let midpoints = [
        glam::Vec2::new(center.x, bbox.min.y),
        glam::Vec2::new(bbox.max.x, center.y),
        glam::Vec2::new(center.x, bbox.max.y),
        glam::Vec2::new(bbox.min.x, center.y),
    ];
    let tolerance = 0.2 * bbox.width().min(bbox.height());
    polygon.iter().all(|corner| {
        let corner = glam::Vec2::new(corner.x as f32, corner.y as f32);
        midpoints
            .iter()
            .any(|midpoint| midpoint.distance(corner) <= tolerance)
    })
}

/// Replaces raw shape masks with a parametric draw.io outline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeProcessor;

impl CategoryProcessor for ShapeProcessor {
    fn name(&self) -> &'static str {
        "ShapeProcessor"
    }

    fn accepts(&self, category: Category) -> bool {
        category == Category::Shape
    }

    fn refine(&self, element: &Element, scene: &Scene) -> Result<Element, FerrdiagError> {
        let image = scene.image;
        let (width, height) = image.dimensions();
        let inner = element.bbox.expand(-0.2);
        let sample = |x: u32, y: u32| (x < width && y < height).then(|| image.get_pixel(x, y));

        let (kind, fit, fill, stroke) = match &element.mask {
            Some(mask) => {
                let shape = fit_shape(mask, &element.bbox).context(RefinementSnafu {
                    id: element.id.clone(),
                    message: "mask has no usable outline",
                })?;
                let interior = pixels_in(&inner)
                    .filter(|(x, y)| mask.is_set(*x, *y))
                    .filter_map(|(x, y)| sample(x, y));
                let outline = shape
                    .contour
                    .iter()
                    .filter_map(|p| sample(p.x.max(0) as u32, p.y.max(0) as u32));
                (shape.kind, shape.fit, median_color(interior), median_color(outline))
            }
            None => {
                let interior = pixels_in(&inner).filter_map(|(x, y)| sample(x, y));
                let border = pixels_in(&element.bbox)
                    .filter(|(x, y)| on_border(&element.bbox, *x, *y))
                    .filter_map(|(x, y)| sample(x, y));
                (ShapeKind::Rectangle, 1.0, median_color(interior), median_color(border))
            }
        };

        let mut refined = element.clone();
        kind.apply(&mut refined.style, &element.bbox);
        refined
            .style
            .set("whiteSpace", "wrap")
            .set("html", "1")
            .set("shapeType", kind.name())
            .set("shapeFit", format!("{fit:.2}"));
        if let Some(fill) = fill {
            refined.style.set("fillColor", hex_color(fill));
        }
        if let Some(stroke) = stroke {
            refined.style.set("strokeColor", hex_color(stroke));
        }
        refined.mask = None;
        Ok(refined)
    }
}

fn pixels_in(bbox: &Bbox) -> impl Iterator<Item = (u32, u32)> {
    let x0 = bbox.min.x.ceil().max(0.0) as u32;
    let y0 = bbox.min.y.ceil().max(0.0) as u32;
    let x1 = bbox.max.x.floor().max(0.0) as u32;
    let y1 = bbox.max.y.floor().max(0.0) as u32;
    (y0..y1).flat_map(move |y| (x0..x1).map(move |x| (x, y)))
}

fn on_border(bbox: &Bbox, x: u32, y: u32) -> bool {
    let (x, y) = (x as f32, y as f32);
    x < bbox.min.x + 1.0 || y < bbox.min.y + 1.0 || x >= bbox.max.x - 1.0 || y >= bbox.max.y - 1.0
}
