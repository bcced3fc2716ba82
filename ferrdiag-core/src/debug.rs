use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use snafu::ResultExt;
use tracing::*;

use crate::{error::FerrdiagError, error::ImageWriteSnafu, layout::document::Document};

/// Outlines every node of `document` on top of `image`, colored by category.
pub fn render_overlay(document: &Document, image: &DynamicImage) -> RgbImage {
    let mut output = image.to_rgb8();

    for node in &document.nodes {
        let x = node.bbox.min.x.round() as i32;
        let y = node.bbox.min.y.round() as i32;
        let width = node.bbox.width().round() as u32;
        let height = node.bbox.height().round() as u32;
        if width == 0 || height == 0 {
            continue;
        }

        let color = Rgb(node.category.color());
        // Two pixels wide
        for offset in 0..2 {
            let rect = Rect::at(x - offset, y - offset)
                .of_size(width + (offset * 2) as u32, height + (offset * 2) as u32);
            draw_hollow_rect_mut(&mut output, rect, color);
        }
    }

    output
}

pub fn save_overlay<P: AsRef<Path>>(
    document: &Document,
    image: &DynamicImage,
    output: P,
) -> Result<(), FerrdiagError> {
    let output = output.as_ref();
    info!("Saving overlay to {:?}", output);
    render_overlay(document, image)
        .save(output)
        .context(ImageWriteSnafu {
            path: output.display().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{bbox::Bbox, labels::Category},
        layout::{
            document::{Node, Origin},
            element::Style,
        },
    };

    #[test]
    fn test_overlay_outlines_nodes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, Rgb([255, 255, 255])));
        let document = Document {
            width: 60,
            height: 40,
            nodes: vec![Node {
                id: "element_0000".into(),
                category: Category::Shape,
                bbox: Bbox::from_xywh(10.0, 10.0, 20.0, 10.0),
                style: Style::new(),
                children: Vec::new(),
                parent: None,
                source: None,
                target: None,
                value: String::new(),
                confidence: 0.9,
                origin: Origin::Element("element_0000".into()),
            }],
        };

        let overlay = render_overlay(&document, &image);
        assert_eq!(overlay.get_pixel(10, 10), &Rgb(Category::Shape.color()));
        assert_eq!(overlay.get_pixel(20, 15), &Rgb([255, 255, 255]));
    }
}
