//! Final detection stage.
//!
//! The classification head of a two-stage detector outputs, for every ROI, a score per class and
//! a class-specific box delta. The [`Detector`] turns these into per-class detections in original
//! image coordinates:
//!
//! - ROIs of every test scale are mapped back to the original image, refined by the delta of each
//!   class and clipped. Boxes of all scales are pooled per class.
//! - Each class is suppressed independently, optionally followed by box voting.
//! - An optional per-image limit keeps only the most confident detections across classes.
//!
//! In iterative mode ([`Detector::detect_iterative`]), refined boxes are fed back through the
//! classification head a configurable number of times before the final decoding.

use frcnn_geometry::{num::TotalF32, Delta, Rect, Resolution};
use ndarray::{Array2, ArrayView2};

use crate::{
    config::DetectionConfig,
    error::{ConfigError, Error, Result},
    image::ImageInfo,
    timer::Timer,
};

use super::{
    coder::BoxCoder,
    nms::{NonMaxSuppression, SuppressionMode},
    roi_array,
    vote::vote,
    Detection, Detections,
};

/// Output of the classification head for one image at one scale.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    rois: Array2<f32>,
    cls_prob: Array2<f32>,
    bbox_pred: Array2<f32>,
}

impl ClassifierOutput {
    /// Bundles ROIs with the class scores and box deltas predicted for them.
    ///
    /// # Parameters
    ///
    /// - `rois`: `[N, 5]` rows of `[batch_index, x1, y1, x2, y2]`, in scaled image coordinates.
    /// - `cls_prob`: `[N, C]` class scores, class 0 being background.
    /// - `bbox_pred`: `[N, 4C]` class-specific deltas; columns `4c..4c + 4` belong to class `c`.
    ///
    /// # Errors
    ///
    /// Fails if the shapes don't match, or an ROI has a batch index other than 0.
    pub fn new(rois: Array2<f32>, cls_prob: Array2<f32>, bbox_pred: Array2<f32>) -> Result<Self> {
        let num_rois = rois.nrows();
        if rois.ncols() != 5 {
            return Err(Error::shape("rois", rois.shape(), "[N, 5]"));
        }
        if cls_prob.nrows() != num_rois {
            return Err(Error::shape(
                "cls_prob",
                cls_prob.shape(),
                format!("[{num_rois}, C]"),
            ));
        }
        let num_classes = cls_prob.ncols();
        if bbox_pred.dim() != (num_rois, 4 * num_classes) {
            return Err(Error::shape(
                "bbox_pred",
                bbox_pred.shape(),
                format!("[{num_rois}, {}]", 4 * num_classes),
            ));
        }
        if let Some((index, &batch)) = rois
            .column(0)
            .iter()
            .enumerate()
            .find(|&(_, &b)| b != 0.0)
        {
            return Err(Error::RoiBatchIndex { index, batch });
        }

        Ok(Self {
            rois,
            cls_prob,
            bbox_pred,
        })
    }

    pub fn num_rois(&self) -> usize {
        self.rois.nrows()
    }

    /// Returns the number of classes, including background.
    pub fn num_classes(&self) -> usize {
        self.cls_prob.ncols()
    }

    pub fn rois(&self) -> ArrayView2<'_, f32> {
        self.rois.view()
    }

    pub fn cls_prob(&self) -> ArrayView2<'_, f32> {
        self.cls_prob.view()
    }

    pub fn bbox_pred(&self) -> ArrayView2<'_, f32> {
        self.bbox_pred.view()
    }

    /// Returns ROI `i` as a box.
    pub fn roi(&self, i: usize) -> Rect {
        let r = &self.rois;
        Rect::from_corners(r[[i, 1]], r[[i, 2]], r[[i, 3]], r[[i, 4]])
    }

    pub fn score(&self, i: usize, class: usize) -> f32 {
        self.cls_prob[[i, class]]
    }

    /// Returns the delta predicted for ROI `i` and `class`.
    pub fn delta(&self, i: usize, class: usize) -> Delta {
        let p = &self.bbox_pred;
        let c = 4 * class;
        Delta::new(p[[i, c]], p[[i, c + 1]], p[[i, c + 2]], p[[i, c + 3]])
    }
}

/// A [`ClassifierOutput`] together with the geometry of the network input it was computed on.
#[derive(Debug, Clone)]
pub struct ScaleOutput {
    pub info: ImageInfo,
    pub output: ClassifierOutput,
}

impl ScaleOutput {
    pub fn new(info: ImageInfo, output: ClassifierOutput) -> Self {
        Self { info, output }
    }
}

/// Reruns the classification head on refined ROIs.
///
/// Implemented by drivers that own the network; used by [`Detector::detect_iterative`].
pub trait Refine {
    /// Classifies `rois` (`[N, 5]`, batch index 0, scaled image coordinates).
    ///
    /// Returns the `[N, C]` class scores and `[N, 4C]` box deltas for those ROIs.
    fn refine(&mut self, rois: ArrayView2<'_, f32>) -> anyhow::Result<(Array2<f32>, Array2<f32>)>;
}

/// Turns classifier outputs into final, per-class detections.
///
/// Like the [`ProposalLayer`][super::proposal::ProposalLayer], a detector holds scratch buffers
/// and should be reused across images by a single worker.
#[derive(Clone)]
pub struct Detector {
    config: DetectionConfig,
    coder: BoxCoder,
    nms: NonMaxSuppression,
    cascade_nms: NonMaxSuppression,
    candidates: Detections,
    backup: Vec<Detection>,
    kept: Vec<Detection>,
    t_decode: Timer,
    t_nms: Timer,
    t_vote: Timer,
    t_refine: Timer,
}

impl Detector {
    pub fn new(config: DetectionConfig) -> Self {
        let mut nms = NonMaxSuppression::new();
        nms.set_iou_thresh(config.nms_thresh);
        nms.set_mode(config.suppression);
        nms.set_score_thresh(config.score_thresh);

        let mut cascade_nms = NonMaxSuppression::new();
        cascade_nms.set_iou_thresh(config.nms_thresh);
        cascade_nms.set_mode(SuppressionMode::Greedy);
        cascade_nms.set_score_thresh(config.score_thresh);

        Self {
            coder: config.coder(),
            config,
            nms,
            cascade_nms,
            candidates: Detections::new(),
            backup: Vec::new(),
            kept: Vec::new(),
            t_decode: Timer::new("decode"),
            t_nms: Timer::new("NMS"),
            t_vote: Timer::new("vote"),
            t_refine: Timer::new("refine"),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Computes the detections of one image from the classifier outputs of every test scale.
    ///
    /// `outputs` must contain one entry per configured scale. `original` is the resolution of
    /// the unscaled input image; all returned boxes lie inside of it.
    ///
    /// If the configuration is unusable or doesn't match the outputs, a warning is logged and no
    /// detections are returned. This includes configurations with refinement passes, which need
    /// [`Detector::detect_iterative`] instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the [`ImageInfo`] of any output is invalid.
    pub fn detect(&mut self, outputs: &[ScaleOutput], original: Resolution) -> Result<Detections> {
        for out in outputs {
            out.info.validate()?;
        }
        let checked = self.check(outputs).and_then(|()| match self.config.cascade_iterations {
            0 => Ok(()),
            passes => Err(ConfigError::CascadeConfigured(passes)),
        });
        if let Err(e) = checked {
            log::warn!("detector misconfigured, returning no detections: {e}");
            return Ok(Detections::new());
        }

        self.candidates.clear();
        self.t_decode.time(|| {
            for out in outputs {
                decode_candidates(
                    &out.output,
                    out.info.scale(),
                    original,
                    &self.coder,
                    self.config.score_thresh,
                    &mut self.candidates,
                );
            }
        });

        let vote_thresh = self.config.vote_thresh;
        let mut detections = Detections::new();
        for (class, candidates) in self.candidates.classes_mut() {
            if candidates.is_empty() {
                continue;
            }
            let num_candidates = candidates.len();

            if vote_thresh.is_some() {
                self.backup.clear();
                self.backup.extend_from_slice(candidates);
            }

            self.kept.clear();
            self.t_nms.time(|| self.kept.extend(self.nms.process(candidates)));

            if let Some(thresh) = vote_thresh {
                self.t_vote.time(|| vote(&mut self.kept, &self.backup, thresh));
            }

            log::trace!(
                "class {class}: {num_candidates} candidates, {} after NMS",
                self.kept.len()
            );
            detections.extend(self.kept.drain(..));
        }

        if let Some(max) = self.config.max_per_image {
            detections.limit_per_image(max);
        }
        log::debug!(
            "{} detections from {} scale(s)",
            detections.len(),
            outputs.len()
        );

        Ok(detections)
    }

    /// Computes the detections of one image with iterative box refinement.
    ///
    /// The first classifier pass is `initial`. Each further pass takes every ROI, moves it to the
    /// box predicted for its most likely non-background class, and asks `refiner` to classify the
    /// moved ROIs again, for a total of `cascade_iterations` passes. The last pass is decoded
    /// like in [`Detector::detect`], but only greedy suppression is applied and no voting.
    ///
    /// Refined ROIs are decoded with the configured `bbox_means` and `bbox_stds`, just like the
    /// final pass. Networks whose refinement deltas are not normalized need identity
    /// means and stds here. Refined ROIs are clipped to the network input image.
    ///
    /// # Errors
    ///
    /// Errors from `refiner`, malformed refinement outputs and an invalid [`ImageInfo`] are
    /// returned.
    pub fn detect_iterative<R: Refine + ?Sized>(
        &mut self,
        initial: ScaleOutput,
        original: Resolution,
        refiner: &mut R,
    ) -> Result<Detections> {
        initial.info.validate()?;
        if let Err(e) = self.check(std::slice::from_ref(&initial)) {
            log::warn!("detector misconfigured, returning no detections: {e}");
            return Ok(Detections::new());
        }

        let ScaleOutput { info, mut output } = initial;
        for pass in 1..self.config.cascade_iterations {
            let rois = self.t_decode.time(|| refined_rois(&output, &info, &self.coder));
            let (cls_prob, bbox_pred) = self
                .t_refine
                .time(|| refiner.refine(rois.view()))
                .map_err(Error::Refine)?;
            output = ClassifierOutput::new(rois, cls_prob, bbox_pred)?;

            if output.num_classes() != self.config.num_classes {
                let e = ConfigError::ClassCount {
                    expected: self.config.num_classes,
                    actual: output.num_classes(),
                };
                log::warn!("refinement pass {pass} failed, returning no detections: {e}");
                return Ok(Detections::new());
            }
            log::trace!("refinement pass {pass} done, {} ROIs", output.num_rois());
        }

        self.candidates.clear();
        self.t_decode.time(|| {
            decode_candidates(
                &output,
                info.scale(),
                original,
                &self.coder,
                self.config.score_thresh,
                &mut self.candidates,
            )
        });

        let mut detections = Detections::new();
        for (_, candidates) in self.candidates.classes_mut() {
            self.kept.clear();
            self.t_nms
                .time(|| self.kept.extend(self.cascade_nms.process(candidates)));
            detections.extend(self.kept.drain(..));
        }

        if let Some(max) = self.config.max_per_image {
            detections.limit_per_image(max);
        }
        log::debug!(
            "{} detections after {} classifier passes",
            detections.len(),
            self.config.cascade_iterations.max(1)
        );

        Ok(detections)
    }

    fn check(&self, outputs: &[ScaleOutput]) -> std::result::Result<(), ConfigError> {
        self.config.validate()?;
        if outputs.len() != self.config.scales.len() {
            return Err(ConfigError::ScaleCount {
                expected: self.config.scales.len(),
                actual: outputs.len(),
            });
        }
        for out in outputs {
            if out.output.num_classes() != self.config.num_classes {
                return Err(ConfigError::ClassCount {
                    expected: self.config.num_classes,
                    actual: out.output.num_classes(),
                });
            }
        }
        Ok(())
    }

    /// Returns profiling timers for decoding, suppression, voting, and refinement.
    pub fn timers(&self) -> impl IntoIterator<Item = &Timer> + '_ {
        [&self.t_decode, &self.t_nms, &self.t_vote, &self.t_refine]
    }
}

/// Decodes every non-background class score that reaches `score_thresh` into a detection in
/// original image coordinates.
fn decode_candidates(
    output: &ClassifierOutput,
    scale: f32,
    original: Resolution,
    coder: &BoxCoder,
    score_thresh: f32,
    candidates: &mut Detections,
) {
    for class in 1..output.num_classes() {
        for i in 0..output.num_rois() {
            let score = output.score(i, class);
            if score < score_thresh {
                continue;
            }

            let roi = output.roi(i) / scale;
            let rect = coder.decode(&roi, output.delta(i, class)).clip_to(original);
            candidates.push(Detection::new(class as u32, score, rect));
        }
    }
}

/// Moves every ROI to the box of its most likely non-background class, staying in scaled image
/// coordinates.
fn refined_rois(output: &ClassifierOutput, info: &ImageInfo, coder: &BoxCoder) -> Array2<f32> {
    roi_array((0..output.num_rois()).map(|i| {
        // `max_by_key` returns the last maximum, so ties go to the higher class id.
        let class = (1..output.num_classes())
            .max_by_key(|&class| TotalF32(output.score(i, class)))
            .unwrap_or(1);
        coder
            .decode(&output.roi(i), output.delta(i, class))
            .clip(info.width(), info.height())
    }))
}
