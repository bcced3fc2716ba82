use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{ImageFormat, imageops::FilterType};
use snafu::{ResultExt, ensure};

use crate::{
    analysis::labels::Category,
    consts::UPSCALE_FACTOR,
    error::{EncodeSnafu, FerrdiagError, RefinementSnafu},
    layout::element::Element,
    process::{CategoryProcessor, Scene, pixel_rect},
};

/// Embeds icons and pictures as image cells cropped from the source.
#[derive(Debug, Clone)]
pub struct IconPictureProcessor {
    upscale_min_side: u32,
}

impl IconPictureProcessor {
    pub fn new(upscale_min_side: u32) -> Self {
        Self { upscale_min_side }
    }
}

impl CategoryProcessor for IconPictureProcessor {
    fn name(&self) -> &'static str {
        "IconPictureProcessor"
    }

    fn accepts(&self, category: Category) -> bool {
        matches!(category, Category::Icon | Category::Picture)
    }

    fn refine(&self, element: &Element, scene: &Scene) -> Result<Element, FerrdiagError> {
        let (x, y, width, height) = pixel_rect(&element.bbox, scene.image);
        ensure!(
            width >= 2 && height >= 2,
            RefinementSnafu {
                id: element.id.clone(),
                message: format!("crop of {width}x{height} px is too small"),
            }
        );

        let mut crop = scene.image.crop_imm(x, y, width, height);
        let upscaled = width.min(height) < self.upscale_min_side;
        if upscaled {
            crop = crop.resize_exact(
                width * UPSCALE_FACTOR,
                height * UPSCALE_FACTOR,
                FilterType::CatmullRom,
            );
        }

        let mut png = Vec::new();
        crop.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context(EncodeSnafu { stage: "png" })?;

        let mut refined = element.clone();
        refined
            .style
            .set("shape", "image")
            .set("html", "1")
            .set("imageAspect", "0")
            .set("aspect", "fixed")
            .set("image", format!("data:image/png,{}", STANDARD.encode(&png)));
        if upscaled {
            refined.style.set("upscaled", UPSCALE_FACTOR.to_string());
        }
        if element.category == Category::Icon {
            refined
                .style
                .set("verticalLabelPosition", "bottom")
                .set("verticalAlign", "top");
        }
        refined.mask = None;
        Ok(refined)
    }
}
