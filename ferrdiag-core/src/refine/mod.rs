//! The bounded extract, process, merge and evaluate state machine.

use std::{sync::Arc, time::Instant};

use image::DynamicImage;
use serde::Serialize;
use snafu::ResultExt;
use tokio::task;
use tracing::*;
use uuid::Uuid;

use crate::{
    compose::compose,
    config::ReconstructConfig,
    error::{FerrdiagError, JoinSnafu, Warning},
    evaluate::{Evaluation, Evaluator},
    extract::{SegmentationExtractor, validate_image},
    inference::{model::SegmentationModel, recognizer::Recognizer},
    layout::{
        document::Document,
        element::{Element, TextBlock},
    },
    process::{Anchor, Processors, Route},
    text::{self, TextRecognition, TextRegion},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Init,
    Extract,
    Process,
    Merge,
    Evaluate,
    Refine,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Extract => "extract",
            Stage::Process => "process",
            Stage::Merge => "merge",
            Stage::Evaluate => "evaluate",
            Stage::Refine => "refine",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub score: f32,
    pub nodes: usize,
    /// Elements and text regions processed in the pass leading to this score.
    pub processed_elements: usize,
    pub processed_regions: usize,
}

/// Everything one reconstruction run owns.
pub struct ProcessingContext {
    pub run_id: Uuid,
    pub image: Arc<DynamicImage>,
    pub config: ReconstructConfig,
    pub stage: Stage,
    /// Evaluations done so far.
    pub iteration: usize,
    /// Elements as extracted; refinement re-derives from these.
    pub baseline: Vec<Element>,
    /// Latest refined elements, index-aligned with `baseline`.
    pub elements: Vec<Element>,
    pub regions: Vec<TextRegion>,
    /// Recognized blocks tagged with their region.
    pub texts: Vec<TextBlock>,
    pub document: Option<Document>,
    pub evaluation: Option<Evaluation>,
    pub warnings: Vec<Warning>,
    pub history: Vec<IterationRecord>,
    pending_elements: Vec<usize>,
    pending_regions: Vec<TextRegion>,
    text_floor: f32,
}

impl ProcessingContext {
    pub fn new(image: Arc<DynamicImage>, config: ReconstructConfig) -> Self {
        let text_floor = config.min_text_confidence;
        Self {
            run_id: Uuid::new_v4(),
            image,
            config,
            stage: Stage::Init,
            iteration: 0,
            baseline: Vec::new(),
            elements: Vec::new(),
            regions: Vec::new(),
            texts: Vec::new(),
            document: None,
            evaluation: None,
            warnings: Vec::new(),
            history: Vec::new(),
            pending_elements: Vec::new(),
            pending_regions: Vec::new(),
            text_floor,
        }
    }

    pub fn score(&self) -> f32 {
        self.evaluation
            .as_ref()
            .map(|evaluation| evaluation.score)
            .unwrap_or_default()
    }

    pub fn text_floor(&self) -> f32 {
        self.text_floor
    }
}

/// Drives a [`ProcessingContext`] from `Init` to `Done`.
pub struct RefinementLoop<'a> {
    model: &'a dyn SegmentationModel,
    evaluator: &'a dyn Evaluator,
    extractor: SegmentationExtractor,
    processors: Processors,
    text: TextRecognition,
}

impl<'a> RefinementLoop<'a> {
    pub fn new(
        model: &'a dyn SegmentationModel,
        recognizer: Arc<dyn Recognizer>,
        evaluator: &'a dyn Evaluator,
        config: &ReconstructConfig,
    ) -> Self {
        Self {
            model,
            evaluator,
            extractor: SegmentationExtractor::from_config(config),
            processors: Processors::from_config(config),
            text: TextRecognition::new(recognizer, config),
        }
    }

    /// Runs until `Done`. Evaluations are bounded by the iteration budget, so
    /// this always terminates.
    pub async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), FerrdiagError> {
        while ctx.stage != Stage::Done {
            let stage = ctx.stage;
            let started = Instant::now();
            ctx.stage = self.step(ctx).await?;
            info!("Stage {} completed in {:?}", stage, started.elapsed());
        }
        Ok(())
    }

    /// Performs the current stage and returns the next one.
    pub async fn step(&self, ctx: &mut ProcessingContext) -> Result<Stage, FerrdiagError> {
        match ctx.stage {
            Stage::Init => {
                validate_image(&ctx.image)?;
                ctx.config.validate()?;
                Ok(Stage::Extract)
            }
            Stage::Extract => {
                self.extract(ctx).await?;
                Ok(Stage::Process)
            }
            Stage::Process => {
                self.process(ctx).await?;
                Ok(Stage::Merge)
            }
            Stage::Merge => {
                self.merge(ctx)?;
                Ok(Stage::Evaluate)
            }
            Stage::Evaluate => Ok(self.evaluate(ctx)),
            Stage::Refine => {
                self.refine(ctx);
                Ok(Stage::Process)
            }
            Stage::Done => Ok(Stage::Done),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn extract(&self, ctx: &mut ProcessingContext) -> Result<(), FerrdiagError> {
        let output = self.model.segment(&ctx.image).await?;
        let result = self.extractor.extract(ctx.image.clone(), Some(&output))?;

        ctx.regions = TextRegion::collect(&result.elements, ctx.image.width(), ctx.image.height());
        ctx.pending_elements = (0..result.elements.len()).collect();
        ctx.pending_regions = ctx.regions.clone();
        ctx.elements = result.elements.clone();
        ctx.baseline = result.elements;
        Ok(())
    }

    /// Category processing on the blocking pool, joined with text recognition.
    #[tracing::instrument(skip_all)]
    async fn process(&self, ctx: &mut ProcessingContext) -> Result<(), FerrdiagError> {
        let pending: Vec<Element> = ctx
            .pending_elements
            .iter()
            .map(|&index| ctx.elements[index].clone())
            .collect();
        let anchors = Anchor::collect(&ctx.elements);
        let processors = self.processors.clone();
        let image = ctx.image.clone();
        let span = Span::current();

        let refine = task::spawn_blocking(move || {
            span.in_scope(|| processors.refine_all(pending, &image, &anchors))
        });
        let recognize = self
            .text
            .recognize(&ctx.image, &ctx.pending_regions, ctx.text_floor)
            .in_current_span();

        let (refined, recognized) = tokio::join!(refine, recognize);
        let (refined, warnings) = refined.context(JoinSnafu { stage: "process" })?;

        // A retried element or region reports only its latest outcome
        let retried: Vec<String> = ctx
            .pending_elements
            .iter()
            .map(|&index| ctx.elements[index].id.clone())
            .chain(ctx.pending_regions.iter().map(|region| region.id.clone()))
            .collect();
        ctx.warnings.retain(|warning| {
            warning
                .subject()
                .is_none_or(|subject| !retried.iter().any(|id| id == subject))
        });

        for (&index, element) in ctx.pending_elements.iter().zip(refined) {
            ctx.elements[index] = element;
        }
        ctx.warnings.extend(warnings);

        // Blocks of re-recognized regions are replaced wholesale
        let replaced: Vec<&str> = ctx
            .pending_regions
            .iter()
            .map(|region| region.id.as_str())
            .collect();
        ctx.texts.retain(|block| {
            block
                .source
                .as_deref()
                .is_none_or(|source| !replaced.contains(&source))
        });
        ctx.texts.extend(recognized.blocks);
        ctx.warnings.extend(recognized.warnings);

        debug!(
            "Processed {} elements and {} text regions",
            ctx.pending_elements.len(),
            ctx.pending_regions.len()
        );
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    fn merge(&self, ctx: &mut ProcessingContext) -> Result<(), FerrdiagError> {
        ctx.texts = text::arrange(std::mem::take(&mut ctx.texts), ctx.config.text_dedup_iou);
        let document = compose(
            &ctx.elements,
            &ctx.texts,
            ctx.image.width(),
            ctx.image.height(),
            ctx.config.overlap_merge_threshold,
        )?;
        ctx.document = Some(document);
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    fn evaluate(&self, ctx: &mut ProcessingContext) -> Stage {
        let Some(document) = ctx.document.as_ref() else {
            return Stage::Merge;
        };
        let evaluation = self.evaluator.evaluate(document, &ctx.image);
        ctx.iteration += 1;
        ctx.history.push(IterationRecord {
            iteration: ctx.iteration,
            score: evaluation.score,
            nodes: document.len(),
            processed_elements: ctx.pending_elements.len(),
            processed_regions: ctx.pending_regions.len(),
        });
        info!(
            "Iteration {} scored {:.4} over {} nodes",
            ctx.iteration,
            evaluation.score,
            document.len()
        );

        let score = evaluation.score;
        ctx.evaluation = Some(evaluation);
        let threshold = ctx.config.quality_threshold;
        let budget = ctx.config.iteration_budget();

        if score >= threshold {
            Stage::Done
        } else if ctx.iteration >= budget {
            warn!(
                "Score {:.4} below threshold {:.4} after {} iterations",
                score, threshold, ctx.iteration
            );
            ctx.warnings
                .push(Warning::QualityBelowThresholdAfterMaxIterations {
                    score,
                    threshold,
                    iterations: ctx.iteration,
                });
            Stage::Done
        } else {
            Stage::Refine
        }
    }

    /// Selects what scored below threshold for another pass: elements are
    /// re-derived from the baseline and searched for in a larger area, text
    /// regions are read again from a larger crop with a lower confidence
    /// floor. Degraded elements and regions whose recognizer calls already
    /// failed are not retried.
    #[tracing::instrument(skip_all)]
    fn refine(&self, ctx: &mut ProcessingContext) {
        let threshold = ctx.config.quality_threshold;
        let expansion = ctx.config.refine_expansion * ctx.iteration as f32;
        let (width, height) = (ctx.image.width(), ctx.image.height());
        let Some(evaluation) = ctx.evaluation.as_ref() else {
            return;
        };
        let failed = |id: &str| {
            ctx.warnings
                .iter()
                .any(|warning| warning.subject() == Some(id))
        };

        let mut pending_elements = Vec::new();
        for (index, element) in ctx.elements.iter().enumerate() {
            if !matches!(self.processors.route(element.category), Route::Processor(_)) {
                continue;
            }
            if element.is_degraded() || failed(&element.id) {
                continue;
            }
            // Absent ids were merged into a survivor and are represented by it
            let Some(subscore) = evaluation.subscore(&element.id) else {
                continue;
            };
            if subscore < threshold {
                pending_elements.push(index);
            }
        }

        let pending_regions: Vec<TextRegion> = ctx
            .regions
            .iter()
            .filter(|region| !failed(&region.id))
            .filter(|region| {
                let mut blocks = ctx
                    .texts
                    .iter()
                    .filter(|block| block.source.as_deref() == Some(region.id.as_str()))
                    .peekable();
                blocks.peek().is_none()
                    || blocks.any(|block| {
                        evaluation
                            .subscore(&block.id)
                            .is_some_and(|subscore| subscore < threshold)
                    })
            })
            .map(|region| TextRegion {
                bbox: region
                    .bbox
                    .expand(expansion)
                    .clamped(width, height)
                    .unwrap_or(region.bbox),
                ..region.clone()
            })
            .collect();

        // Geometry stays at the baseline box, only the search area grows
        for &index in &pending_elements {
            let mut element = ctx.baseline[index].clone();
            element.search = element.bbox.expand(expansion).clamped(width, height);
            ctx.elements[index] = element;
        }

        ctx.text_floor = (ctx.text_floor - ctx.config.text_floor_step).max(0.0);
        debug!(
            "Refining {} elements and {} text regions, text floor {:.2}",
            pending_elements.len(),
            pending_regions.len(),
            ctx.text_floor
        );
        ctx.pending_elements = pending_elements;
        ctx.pending_regions = pending_regions;
    }
}
