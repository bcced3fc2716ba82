use std::{path::Path, sync::Arc};

use image::DynamicImage;
use serde::Serialize;
use snafu::ResultExt;
use tracing::*;
use uuid::Uuid;

use crate::{
    config::ReconstructConfig,
    error::{FerrdiagError, ImageReadSnafu, Warning},
    evaluate::{Evaluator, QualityEvaluator},
    inference::{model::SegmentationModel, recognizer::Recognizer},
    layout::document::Document,
    refine::{IterationRecord, ProcessingContext, RefinementLoop},
};

/// Decodes the diagram image at `path`.
pub fn open_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage, FerrdiagError> {
    let path = path.as_ref();
    image::open(path).context(ImageReadSnafu {
        path: path.display().to_string(),
    })
}

/// Result of [`Reconstructor::reconstruct`].
#[derive(Debug, Clone, Serialize)]
pub struct Reconstruction {
    pub run_id: Uuid,
    pub document: Document,
    pub score: f32,
    pub warnings: Vec<Warning>,
    pub iterations: usize,
    pub history: Vec<IterationRecord>,
}

/// Turns a raster diagram into an editable [`Document`].
///
/// The model, the recognizer and the evaluator are shared and may serve any
/// number of concurrent runs; each run owns its own state.
#[derive(Clone)]
pub struct Reconstructor {
    model: Arc<dyn SegmentationModel>,
    recognizer: Arc<dyn Recognizer>,
    evaluator: Arc<dyn Evaluator>,
}

impl Reconstructor {
    pub fn new(model: Arc<dyn SegmentationModel>, recognizer: Arc<dyn Recognizer>) -> Self {
        Self {
            model,
            recognizer,
            evaluator: Arc::new(QualityEvaluator::default()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub async fn reconstruct(
        &self,
        image: &DynamicImage,
        config: &ReconstructConfig,
    ) -> Result<Reconstruction, FerrdiagError> {
        let mut ctx = ProcessingContext::new(Arc::new(image.clone()), config.clone());
        let span = info_span!("reconstruct", run_id = %ctx.run_id, model = self.model.name());

        async move {
            info!(
                "Reconstructing {}x{} image",
                ctx.image.width(),
                ctx.image.height()
            );
            let refinement = RefinementLoop::new(
                self.model.as_ref(),
                self.recognizer.clone(),
                self.evaluator.as_ref(),
                &ctx.config,
            );
            refinement.run(&mut ctx).await?;

            let score = ctx.score();
            let document = ctx
                .document
                .take()
                .unwrap_or_else(|| Document::empty(ctx.image.width(), ctx.image.height()));
            info!(
                "Reconstructed {} nodes, score {:.4}, {} warnings after {} iterations",
                document.len(),
                score,
                ctx.warnings.len(),
                ctx.iteration
            );

            Ok::<_, FerrdiagError>(Reconstruction {
                run_id: ctx.run_id,
                document,
                score,
                warnings: ctx.warnings,
                iterations: ctx.iteration,
                history: ctx.history,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{bbox::Bbox, labels::Category},
        compose::drawio::{from_drawio, to_drawio},
        config::ReconstructConfigBuilder,
        evaluate::Evaluation,
        error::RecognitionError,
        inference::{
            model::JsonSegmentation,
            recognizer::{RecognitionHints, RegionImage, StaticRecognizer},
        },
        layout::{document::Origin, element::TextBlock},
    };
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use imageproc::{
        drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut},
        rect::Rect,
    };

    /// Two boxes joined by a horizontal arrow, a caption inside the first.
    fn diagram() -> DynamicImage {
        let mut image = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        draw_filled_rect_mut(&mut image, Rect::at(20, 40).of_size(80, 60), Rgb([218, 232, 252]));
        draw_hollow_rect_mut(&mut image, Rect::at(20, 40).of_size(80, 60), Rgb([108, 142, 191]));
        draw_filled_rect_mut(&mut image, Rect::at(220, 40).of_size(80, 60), Rgb([218, 232, 252]));
        draw_hollow_rect_mut(&mut image, Rect::at(220, 40).of_size(80, 60), Rgb([108, 142, 191]));
        for dy in -1..=1 {
            let y = 70.0 + dy as f32;
            draw_line_segment_mut(&mut image, (100.0, y), (220.0, y), Rgb([0, 0, 0]));
        }
        draw_filled_rect_mut(&mut image, Rect::at(208, 62).of_size(12, 17), Rgb([0, 0, 0]));
        draw_filled_rect_mut(&mut image, Rect::at(40, 62).of_size(40, 14), Rgb([30, 30, 30]));
        DynamicImage::ImageRgb8(image)
    }

    const SEGMENTATION: &str = r#"{
        "regions": [
            {"label": "rectangle", "score": 0.95, "box": [20, 40, 100, 100]},
            {"label": "rectangle", "score": 0.93, "box": [220, 40, 300, 100]},
            {"label": "arrow", "score": 0.9, "polygon": [
                [100, 67], [220, 67], [220, 62], [208, 62],
                [208, 79], [220, 79], [220, 73], [100, 73]
            ]},
            {"label": "text", "score": 0.88, "box": [36, 58, 84, 80]}
        ]
    }"#;

    fn reconstructor() -> Reconstructor {
        let model = Arc::new(JsonSegmentation::from_json(SEGMENTATION).unwrap());
        let recognizer = Arc::new(StaticRecognizer::new(vec![TextBlock::new(
            "Start",
            Bbox::from_xywh(40.0, 62.0, 40.0, 14.0),
            0.92,
        )]));
        Reconstructor::new(model, recognizer)
    }

    #[tokio::test]
    async fn test_reconstruct_diagram() {
        let config = ReconstructConfigBuilder::default()
            .quality_threshold(0.5)
            .build()
            .unwrap();
        let result = reconstructor().reconstruct(&diagram(), &config).await.unwrap();

        assert!(result.iterations >= 1 && result.iterations <= config.iteration_budget());
        assert_eq!(result.history.len(), result.iterations);
        assert!((0.0..=1.0).contains(&result.score));

        let document = &result.document;
        assert_eq!(document.count(Category::Shape), 2);
        assert_eq!(document.count(Category::Arrow), 1);
        assert_eq!(document.count(Category::Text), 1);

        let text = document
            .nodes
            .iter()
            .find(|node| node.category == Category::Text)
            .unwrap();
        assert_eq!(text.value, "Start");
        assert_eq!(text.origin, Origin::Text("text_0000".into()));

        // Arrow sits above the shapes, text above everything
        let layers: Vec<_> = document.nodes.iter().map(|node| node.category.layer()).collect();
        assert!(layers.windows(2).all(|pair| pair[0] <= pair[1]));

        let arrow = document.nodes.iter().find(|node| node.is_edge()).unwrap();
        assert_eq!(arrow.source.as_deref(), Some("element_0000"));
        assert_eq!(arrow.target.as_deref(), Some("element_0001"));

        let xml = to_drawio(document);
        assert_eq!(&from_drawio(&xml).unwrap(), document);
    }

    #[tokio::test]
    async fn test_unreachable_threshold_reports_warning() {
        let config = ReconstructConfigBuilder::default()
            .quality_threshold(1.0)
            .max_iterations(2usize)
            .build()
            .unwrap();
        let result = reconstructor().reconstruct(&diagram(), &config).await.unwrap();

        assert_eq!(result.iterations, 2);
        assert!(result.warnings.iter().any(|warning| matches!(
            warning,
            Warning::QualityBelowThresholdAfterMaxIterations { iterations: 2, .. }
        )));
    }

    #[tokio::test]
    async fn test_blank_segmentation_yields_empty_document() {
        let model = Arc::new(JsonSegmentation::from_json(r#"{"regions": []}"#).unwrap());
        let reconstructor = Reconstructor::new(model, Arc::new(StaticRecognizer::default()));
        let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, Rgb([255, 255, 255])));

        let result = reconstructor
            .reconstruct(&blank, &ReconstructConfig::default())
            .await
            .unwrap();
        assert!(result.document.is_empty());
        assert_eq!((result.document.width, result.document.height), (64, 32));
        // Nothing to explain
        assert_eq!(result.score, 1.0);
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_custom_evaluator_decides_convergence() {
        struct Perfect;

        impl Evaluator for Perfect {
            fn evaluate(&self, document: &Document, _image: &DynamicImage) -> Evaluation {
                Evaluation {
                    score: 1.0,
                    subscores: document.nodes.iter().map(|node| (node.id.clone(), 1.0)).collect(),
                }
            }
        }

        let config = ReconstructConfigBuilder::default()
            .quality_threshold(1.0)
            .build()
            .unwrap();
        let result = reconstructor()
            .with_evaluator(Arc::new(Perfect))
            .reconstruct(&diagram(), &config)
            .await
            .unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.score, 1.0);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_empty_image_is_rejected() {
        let result = reconstructor()
            .reconstruct(&DynamicImage::new_rgb8(0, 0), &ReconstructConfig::default())
            .await;
        assert!(matches!(result, Err(FerrdiagError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_refinement_keeps_element_geometry() {
        let reconstruct = |max_iterations: usize| {
            let config = ReconstructConfigBuilder::default()
                .quality_threshold(1.0)
                .max_iterations(max_iterations)
                .build()
                .unwrap();
            async move { reconstructor().reconstruct(&diagram(), &config).await.unwrap() }
        };
        let single = reconstruct(1).await;
        let refined = reconstruct(3).await;

        assert_eq!(refined.iterations, 3);
        // Shapes and the arrow went through every pass
        assert!(refined.history[2].processed_elements >= 3);
        for node in &refined.document.nodes {
            let first = single.document.node(&node.id).unwrap();
            assert_eq!(node.bbox, first.bbox, "{} moved", node.id);
        }
        let shape = refined.document.node("element_0000").unwrap();
        assert_eq!(shape.bbox, Bbox::from_xywh(20.0, 40.0, 80.0, 60.0));
    }

    /// Answers every region except one, which never returns.
    struct Stalling {
        silent: &'static str,
    }

    #[async_trait]
    impl Recognizer for Stalling {
        async fn recognize(
            &self,
            region: &RegionImage,
            _hints: &RecognitionHints,
        ) -> Result<Vec<TextBlock>, RecognitionError> {
            if region.id == self.silent {
                std::future::pending::<()>().await;
            }
            let bbox = Bbox::from_xywh(2.0, 2.0, 40.0, 12.0);
            Ok(vec![TextBlock::new("Ready", bbox, 0.9)])
        }
    }

    #[tokio::test]
    async fn test_silent_region_warns_once() {
        let segmentation = r#"{
            "regions": [
                {"label": "text", "score": 0.9, "box": [20, 20, 80, 40]},
                {"label": "text", "score": 0.9, "box": [120, 20, 180, 40]}
            ]
        }"#;
        let mut image = RgbImage::from_pixel(200, 60, Rgb([255, 255, 255]));
        draw_filled_rect_mut(&mut image, Rect::at(24, 24).of_size(40, 12), Rgb([0, 0, 0]));
        draw_filled_rect_mut(&mut image, Rect::at(124, 24).of_size(40, 12), Rgb([0, 0, 0]));
        let image = DynamicImage::ImageRgb8(image);

        let model = Arc::new(JsonSegmentation::from_json(segmentation).unwrap());
        let recognizer = Arc::new(Stalling {
            silent: "element_0001",
        });
        let config = ReconstructConfigBuilder::default()
            .quality_threshold(1.0)
            .max_iterations(3usize)
            .recognition_timeout_ms(20u64)
            .recognition_max_attempts(2usize)
            .recognition_backoff_ms(1u64)
            .build()
            .unwrap();

        let result = Reconstructor::new(model, recognizer)
            .reconstruct(&image, &config)
            .await
            .unwrap();

        assert_eq!(result.iterations, 3);
        let timeouts: Vec<&Warning> = result
            .warnings
            .iter()
            .filter(|warning| matches!(warning, Warning::RecognitionTimeout { .. }))
            .collect();
        assert_eq!(
            timeouts,
            vec![&Warning::RecognitionTimeout {
                region: "element_0001".into(),
                attempts: 2,
            }]
        );
        // The silent region is not retried, the other one is
        assert_eq!(result.history[1].processed_regions, 1);
        assert_eq!(result.history[2].processed_regions, 1);

        let texts: Vec<&str> = result
            .document
            .nodes
            .iter()
            .map(|node| node.value.as_str())
            .collect();
        assert_eq!(texts, vec!["Ready"]);
        assert_eq!(
            result.document.nodes[0].origin,
            Origin::Text("text_0000".into())
        );
    }

    #[tokio::test]
    async fn test_no_elements_means_no_nodes() {
        let model = Arc::new(JsonSegmentation::from_json(r#"{"regions": []}"#).unwrap());
        // The recognizer would find text if it were asked
        let recognizer = Arc::new(StaticRecognizer::new(vec![TextBlock::new(
            "Start",
            Bbox::from_xywh(40.0, 62.0, 40.0, 14.0),
            0.92,
        )]));
        let config = ReconstructConfigBuilder::default()
            .max_iterations(2usize)
            .build()
            .unwrap();

        let result = Reconstructor::new(model, recognizer)
            .reconstruct(&diagram(), &config)
            .await
            .unwrap();
        assert!(result.document.is_empty());
        assert!(result.history.iter().all(|record| record.processed_regions == 0));
    }

    #[test]
    fn test_open_missing_image() {
        let path = std::env::temp_dir().join(format!("ferrdiag-{}.png", Uuid::new_v4()));
        let err = open_image(&path).unwrap_err();
        assert!(matches!(err, FerrdiagError::ImageRead { .. }));
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let reconstructor = reconstructor();
        let config = ReconstructConfig::default();
        let image = diagram();

        let (first, second) = tokio::join!(
            reconstructor.reconstruct(&image, &config),
            reconstructor.reconstruct(&image, &config)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.document, second.document);
        assert_eq!(first.score, second.score);
    }
}
