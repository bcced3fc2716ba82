use glam::Vec2;
use imageproc::geometry::convex_hull;

use crate::{
    analysis::labels::Category,
    consts::ARROW_END_FRACTION,
    error::{FerrdiagError, RefinementSnafu},
    layout::element::{Connection, Element},
    process::{Anchor, CategoryProcessor, Scene},
};

/// Resolves arrow endpoints to the elements they connect.
#[derive(Debug, Clone)]
pub struct ArrowProcessor {
    tolerance: f32,
}

impl ArrowProcessor {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }

    /// Nearest anchor within `tolerance` of `point`; earlier anchors win ties.
    fn resolve(
        &self,
        point: Vec2,
        tolerance: f32,
        own_id: &str,
        anchors: &[Anchor],
    ) -> Option<String> {
        let mut best: Option<(&Anchor, f32)> = None;
        for anchor in anchors.iter().filter(|anchor| anchor.id != own_id) {
            let distance = anchor.bbox.distance_to_point(point);
            if distance > tolerance {
                continue;
            }
            if best.is_none_or(|(_, best_distance)| distance < best_distance) {
                best = Some((anchor, distance));
            }
        }
        best.map(|(anchor, _)| anchor.id.clone())
    }
}

/// How far the search area reaches past the element box on its widest side.
fn search_margin(element: &Element) -> f32 {
    let search = element.search_area();
    let before = element.bbox.min - search.min;
    let after = search.max - element.bbox.max;
    before.max(after).max_element().max(0.0)
}

/// Compass direction of travel from `start` to `end`, y growing downward.
pub fn direction(start: Vec2, end: Vec2) -> &'static str {
    let delta = end - start;
    let angle = delta.y.atan2(delta.x).to_degrees().rem_euclid(360.0);
    match angle {
        a if (45.0..135.0).contains(&a) => "down",
        a if (135.0..225.0).contains(&a) => "left",
        a if (225.0..315.0).contains(&a) => "up",
        _ => "right",
    }
}

/// Start and end of the arrow, head at `end`.
fn endpoints(element: &Element) -> Result<(Vec2, Vec2), FerrdiagError> {
    let Some(mask) = &element.mask else {
        // Without geometry assume left-to-right or top-to-bottom along the long side.
        let bbox = element.bbox;
        let center = bbox.center();
        return Ok(if bbox.width() >= bbox.height() {
            (Vec2::new(bbox.min.x, center.y), Vec2::new(bbox.max.x, center.y))
        } else {
            (Vec2::new(center.x, bbox.min.y), Vec2::new(center.x, bbox.max.y))
        });
    };

    let contour = mask.outer_contour().unwrap_or_default();
    let hull = if contour.is_empty() {
        Vec::new()
    } else {
        convex_hull(contour.as_slice())
    };
    let mut diameter: Option<(Vec2, Vec2, f32)> = None;
    for (index, a) in hull.iter().enumerate() {
        for b in &hull[index + 1..] {
            let (a, b) = (
                Vec2::new(a.x as f32 + 0.5, a.y as f32 + 0.5),
                Vec2::new(b.x as f32 + 0.5, b.y as f32 + 0.5),
            );
            let length = a.distance(b);
            if diameter.is_none_or(|(_, _, best)| length > best) {
                diameter = Some((a, b, length));
            }
        }
    }

    let (a, b, length) = diameter.ok_or_else(|| {
        RefinementSnafu {
            id: element.id.clone(),
            message: "arrow mask has no extent",
        }
        .build()
    })?;
    if length < 2.0 {
        return RefinementSnafu {
            id: element.id.clone(),
            message: format!("arrow is only {length:.1} px long"),
        }
        .fail();
    }

    // The head carries more ink than the tail
    let (mass_a, mass_b) = mask.end_mass(a, b, ARROW_END_FRACTION);
    if mass_a > mass_b {
        Ok((b, a))
    } else {
        Ok((a, b))
    }
}

impl CategoryProcessor for ArrowProcessor {
    fn name(&self) -> &'static str {
        "ArrowProcessor"
    }

    fn accepts(&self, category: Category) -> bool {
        category == Category::Arrow
    }

    fn refine(&self, element: &Element, scene: &Scene) -> Result<Element, FerrdiagError> {
        let (start, end) = endpoints(element)?;
        let tolerance = self.tolerance + search_margin(element);
        let source = self.resolve(start, tolerance, &element.id, scene.anchors);
        let target = self.resolve(end, tolerance, &element.id, scene.anchors);

        let connection = Connection {
            start,
            end,
            source,
            target,
        };

        let mut refined = element.clone();
        refined.children = connection
            .source
            .iter()
            .chain(connection.target.iter())
            .cloned()
            .collect();
        refined
            .style
            .set("endArrow", "classic")
            .set("html", "1")
            .set("rounded", "0")
            .set("arrowDirection", direction(start, end))
            .set("sourcePoint", format!("{},{}", start.x, start.y))
            .set("targetPoint", format!("{},{}", end.x, end.y));
        if connection.is_dangling() {
            refined.style.set("dangling", "1");
        } else {
            refined.style.remove("dangling");
        }
        refined.connection = Some(connection);
        refined.mask = None;
        Ok(refined)
    }
}
