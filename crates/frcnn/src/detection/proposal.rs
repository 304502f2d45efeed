//! Region proposal generation.
//!
//! The [`ProposalLayer`] decodes the dense output of a region proposal network (one objectness
//! score and one box delta per anchor) into a bounded list of class-agnostic regions of interest.
//!
//! The layer runs these steps on every call:
//!
//! 1. Every anchor of the feature map is shifted into place, transformed by its predicted delta
//!    and clipped to the image. Boxes smaller than the minimum size are dropped.
//! 2. The remaining candidates are sorted by decreasing score, and only the best
//!    `pre_nms_top_n` are kept.
//! 3. Non-maximum suppression reduces them to at most `post_nms_top_n` proposals.

use std::cmp::Reverse;

use frcnn_geometry::{num::TotalF32, Delta, Rect, Resolution};
use ndarray::{s, Array2, ArrayView4};

use crate::{
    config::ProposalConfig,
    error::{ConfigError, Error, Result},
    image::ImageInfo,
    timer::Timer,
};

use super::{
    anchor::{AnchorTemplates, Anchors},
    nms::NonMaxSuppression,
    roi_array, Detection,
};

/// Converts region proposal network outputs into proposals.
///
/// A layer keeps scratch buffers and cached anchors between calls, so it should be reused across
/// images. It is not meant to be shared between threads; use one layer per worker instead.
#[derive(Clone)]
pub struct ProposalLayer {
    config: ProposalConfig,
    templates: AnchorTemplates,
    anchors: Option<Anchors>,
    nms: NonMaxSuppression,
    candidates: Vec<Detection>,
    t_decode: Timer,
    t_nms: Timer,
}

impl ProposalLayer {
    pub fn new(config: ProposalConfig, templates: AnchorTemplates) -> Self {
        let mut nms = NonMaxSuppression::new();
        nms.set_iou_thresh(config.nms_thresh);
        nms.set_mode(config.suppression);
        nms.set_limit(Some(config.post_nms_top_n));

        Self {
            config,
            templates,
            anchors: None,
            nms,
            candidates: Vec::new(),
            t_decode: Timer::new("decode"),
            t_nms: Timer::new("NMS"),
        }
    }

    pub fn config(&self) -> &ProposalConfig {
        &self.config
    }

    pub fn templates(&self) -> &AnchorTemplates {
        &self.templates
    }

    /// Computes the proposals for one image.
    ///
    /// # Parameters
    ///
    /// - `scores`: objectness scores of shape `[1, A, H, W]`, or `[1, 2A, H, W]` with background
    ///   scores in the first `A` channels and foreground scores in the last `A`, where `A` is the
    ///   number of anchor templates.
    /// - `deltas`: box deltas of shape `[1, 4A, H, W]`; channel `4k + c` holds component `c` of
    ///   `(dx, dy, dw, dh)` for template `k`.
    /// - `info`: size and scale factor of the network input image.
    ///
    /// # Errors
    ///
    /// Returns an error if the input shapes are inconsistent with each other or with the number
    /// of anchor templates, or if `info` is invalid. If the configuration is unusable, a warning is logged and an empty
    /// list of proposals is returned instead.
    pub fn forward(
        &mut self,
        scores: ArrayView4<'_, f32>,
        deltas: ArrayView4<'_, f32>,
        info: &ImageInfo,
    ) -> Result<Proposals> {
        let (batch, score_channels, height, width) = scores.dim();
        if batch != 1 {
            return Err(Error::BatchSize {
                name: "scores",
                batch,
            });
        }
        let (batch, delta_channels, delta_height, delta_width) = deltas.dim();
        if batch != 1 {
            return Err(Error::BatchSize {
                name: "deltas",
                batch,
            });
        }
        if delta_channels % 4 != 0 || (delta_height, delta_width) != (height, width) {
            return Err(Error::shape(
                "deltas",
                deltas.shape(),
                format!("[1, 4A, {height}, {width}]"),
            ));
        }

        info.validate()?;

        if let Err(e) = self.validate() {
            log::warn!("proposal layer misconfigured, returning no proposals: {e}");
            return Ok(Proposals::default());
        }

        let per_cell = self.templates.len();
        if delta_channels != 4 * per_cell {
            return Err(Error::shape(
                "deltas",
                deltas.shape(),
                format!("[1, {}, {height}, {width}]", 4 * per_cell),
            ));
        }
        let fg_offset = if score_channels == per_cell {
            0
        } else if score_channels == 2 * per_cell {
            per_cell
        } else {
            return Err(Error::shape(
                "scores",
                scores.shape(),
                format!("[1, {per_cell} or {}, {height}, {width}]", 2 * per_cell),
            ));
        };
        let fg_scores = scores.slice(s![0, fg_offset..fg_offset + per_cell, .., ..]);
        let deltas = deltas.slice(s![0, .., .., ..]);

        let feature_map = Resolution::new(width as u32, height as u32);
        let stride = self.config.feat_stride;
        let anchors = match self.anchors.take() {
            Some(anchors) if anchors.feature_map() == feature_map && anchors.stride() == stride => {
                anchors
            }
            _ => {
                log::debug!("computing anchors for {feature_map} feature map (stride {stride})");
                Anchors::calculate(&self.templates, feature_map, stride)
            }
        };
        let anchors = &*self.anchors.insert(anchors);

        let min_size = self.config.min_size * info.scale();
        let score_thresh = self.config.score_thresh;
        self.candidates.clear();
        self.t_decode.time(|| {
            for row in 0..height {
                for col in 0..width {
                    for k in 0..per_cell {
                        let score = fg_scores[[k, row, col]];
                        // The first template is always kept, so every cell contributes.
                        if let Some(thresh) = score_thresh {
                            if k > 0 && score < thresh {
                                continue;
                            }
                        }

                        let delta = Delta::new(
                            deltas[[4 * k, row, col]],
                            deltas[[4 * k + 1, row, col]],
                            deltas[[4 * k + 2, row, col]],
                            deltas[[4 * k + 3, row, col]],
                        );
                        let rect = anchors
                            .get(row, col, k)
                            .transform(delta)
                            .clip(info.width(), info.height());

                        if rect.width() >= min_size && rect.height() >= min_size {
                            self.candidates.push(Detection::new(0, score, rect));
                        }
                    }
                }
            }
        });
        log::trace!(
            "{} of {} anchors survived clipping and size filtering",
            self.candidates.len(),
            anchors.anchor_count(),
        );

        // Stable: equally scored candidates stay in anchor order.
        self.candidates
            .sort_by_key(|det| Reverse(TotalF32(det.confidence)));
        self.candidates.truncate(self.config.pre_nms_top_n);
        log::trace!("{} candidates enter NMS", self.candidates.len());

        let proposals: Proposals = self
            .t_nms
            .time(|| self.nms.process(&mut self.candidates).collect());
        log::trace!("{} proposals after NMS", proposals.len());

        Ok(proposals)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.config.validate()?;
        if self.templates.is_empty() {
            return Err(ConfigError::NoAnchors);
        }
        Ok(())
    }

    /// Returns profiling timers for decoding and suppression.
    pub fn timers(&self) -> impl IntoIterator<Item = &Timer> + '_ {
        [&self.t_decode, &self.t_nms]
    }
}

/// Regions of interest emitted by the [`ProposalLayer`], ordered by decreasing score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposals {
    rects: Vec<Rect>,
    scores: Vec<f32>,
}

impl Proposals {
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Returns the objectness score of each proposal.
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn iter(&self) -> impl Iterator<Item = (Rect, f32)> + '_ {
        self.rects.iter().copied().zip(self.scores.iter().copied())
    }

    /// Returns the proposals in the `[N, 5]` ROI layout consumed by ROI pooling layers.
    ///
    /// Each row is `[batch_index, x1, y1, x2, y2]`, where the batch index is always 0.
    pub fn rois(&self) -> Array2<f32> {
        roi_array(self.rects.iter().copied())
    }
}

impl FromIterator<Detection> for Proposals {
    fn from_iter<T: IntoIterator<Item = Detection>>(iter: T) -> Self {
        let (rects, scores) = iter
            .into_iter()
            .map(|det| (det.bounding_rect(), det.confidence()))
            .unzip();
        Self { rects, scores }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use crate::detection::nms::SuppressionMode;

    use super::*;

    fn single_template() -> AnchorTemplates {
        AnchorTemplates::from_flat(&[0.0, 0.0, 15.0, 15.0]).unwrap()
    }

    fn config() -> ProposalConfig {
        ProposalConfig {
            min_size: 1.0,
            ..ProposalConfig::default()
        }
    }

    fn info(width: u32, height: u32) -> ImageInfo {
        ImageInfo::new(Resolution::new(width, height), 1.0)
    }

    #[test]
    fn single_cell_zero_delta() {
        let mut layer = ProposalLayer::new(config(), single_template());
        let scores = Array4::from_elem((1, 1, 1, 1), 0.9);
        let deltas = Array4::zeros((1, 4, 1, 1));

        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals.rects()[0], Rect::from_corners(0.0, 0.0, 15.0, 15.0));
        assert_eq!(proposals.scores(), &[0.9]);

        let rois = proposals.rois();
        assert_eq!(rois.shape(), &[1, 5]);
        assert_eq!(rois.row(0).to_vec(), vec![0.0, 0.0, 0.0, 15.0, 15.0]);
    }

    #[test]
    fn minimal_scenario() {
        let config = ProposalConfig {
            pre_nms_top_n: 1,
            post_nms_top_n: 1,
            nms_thresh: 0.5,
            min_size: 0.0,
            ..ProposalConfig::default()
        };
        let mut layer = ProposalLayer::new(config, single_template());
        let scores = Array4::from_elem((1, 1, 1, 1), 0.9);
        let deltas = Array4::zeros((1, 4, 1, 1));

        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(32, 32))
            .unwrap();
        let all = proposals.iter().collect::<Vec<_>>();
        assert_eq!(all, [(Rect::from_corners(0.0, 0.0, 15.0, 15.0), 0.9)]);
    }

    #[test]
    fn boxes_are_clipped_and_filtered() {
        let config = ProposalConfig {
            min_size: 10.0,
            ..ProposalConfig::default()
        };
        let mut layer = ProposalLayer::new(config, single_template());
        // 2x1 feature map; the second anchor spans x 16..=31 and gets clipped to 16..=19.
        let scores = Array4::from_elem((1, 1, 1, 2), 0.5);
        let deltas = Array4::zeros((1, 4, 1, 2));

        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(20, 20))
            .unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals.rects()[0], Rect::from_corners(0.0, 0.0, 15.0, 15.0));
    }

    #[test]
    fn min_size_scales_with_image() {
        let config = ProposalConfig {
            min_size: 10.0,
            ..ProposalConfig::default()
        };
        let mut layer = ProposalLayer::new(config, single_template());
        let scores = Array4::from_elem((1, 1, 1, 1), 0.5);
        let deltas = Array4::zeros((1, 4, 1, 1));

        // 16 pixel boxes are smaller than 10 * 2.
        let info = ImageInfo::new(Resolution::new(100, 100), 2.0);
        let proposals = layer.forward(scores.view(), deltas.view(), &info).unwrap();
        assert!(proposals.is_empty());
    }

    #[test]
    fn foreground_half_of_two_class_scores() {
        let templates =
            AnchorTemplates::from_flat(&[0.0, 0.0, 15.0, 15.0, 0.0, 0.0, 31.0, 31.0]).unwrap();
        let mut layer = ProposalLayer::new(
            ProposalConfig {
                nms_thresh: 1.0,
                ..config()
            },
            templates,
        );

        // Channels: bg0, bg1, fg0, fg1.
        let scores = Array4::from_shape_vec((1, 4, 1, 1), vec![0.9, 0.8, 0.1, 0.2]).unwrap();
        let deltas = Array4::zeros((1, 8, 1, 1));
        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();

        assert_eq!(proposals.scores(), &[0.2, 0.1]);
        assert_eq!(proposals.rects()[0], Rect::from_corners(0.0, 0.0, 31.0, 31.0));
    }

    #[test]
    fn score_short_circuit_keeps_first_template() {
        let templates =
            AnchorTemplates::from_flat(&[0.0, 0.0, 15.0, 15.0, 0.0, 0.0, 31.0, 31.0]).unwrap();
        let config = ProposalConfig {
            nms_thresh: 1.0,
            score_thresh: Some(0.5),
            ..config()
        };
        let mut layer = ProposalLayer::new(config, templates);

        let scores = Array4::from_shape_vec((1, 2, 1, 1), vec![0.1, 0.2]).unwrap();
        let deltas = Array4::zeros((1, 8, 1, 1));
        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();

        assert_eq!(proposals.scores(), &[0.1]);
    }

    #[test]
    fn top_n_limits() {
        let config = ProposalConfig {
            pre_nms_top_n: 3,
            post_nms_top_n: 2,
            nms_thresh: 1.0,
            ..config()
        };
        let mut layer = ProposalLayer::new(config, single_template());
        let scores =
            Array4::from_shape_vec((1, 1, 1, 4), vec![0.1, 0.4, 0.3, 0.2]).unwrap();
        let deltas = Array4::zeros((1, 4, 1, 4));

        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();
        assert_eq!(proposals.scores(), &[0.4, 0.3]);
        assert_eq!(proposals.rects()[0], Rect::from_corners(16.0, 0.0, 31.0, 15.0));
    }

    #[test]
    fn soft_nms_proposals() {
        let config = ProposalConfig {
            suppression: SuppressionMode::SOFT_GAUSSIAN,
            ..config()
        };
        let mut layer = ProposalLayer::new(config, single_template());
        let scores = Array4::from_shape_vec((1, 1, 1, 2), vec![0.9, 0.8]).unwrap();
        // Shift the second box onto the first one.
        let mut deltas = Array4::zeros((1, 4, 1, 2));
        deltas[[0, 0, 0, 1]] = -1.0;

        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals.scores()[0], 0.9);
        assert!(proposals.scores()[1] < 0.8 * 0.2);
    }

    #[test]
    fn misconfiguration_yields_empty() {
        let config = ProposalConfig {
            pre_nms_top_n: 0,
            ..config()
        };
        let mut layer = ProposalLayer::new(config, single_template());
        let scores = Array4::from_elem((1, 1, 1, 1), 0.9);
        let deltas = Array4::zeros((1, 4, 1, 1));
        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();
        assert!(proposals.is_empty());

        let mut layer = ProposalLayer::new(ProposalConfig::default(), AnchorTemplates::new(vec![]));
        let deltas = Array4::<f32>::zeros((1, 0, 1, 1));
        let proposals = layer
            .forward(scores.view(), deltas.view(), &info(100, 100))
            .unwrap();
        assert!(proposals.is_empty());
    }

    #[test]
    fn shape_errors() {
        let mut layer = ProposalLayer::new(config(), single_template());

        let scores = Array4::from_elem((2, 1, 1, 1), 0.9);
        let deltas = Array4::zeros((2, 4, 1, 1));
        assert!(matches!(
            layer.forward(scores.view(), deltas.view(), &info(100, 100)),
            Err(Error::BatchSize { name: "scores", batch: 2 })
        ));

        let scores = Array4::from_elem((1, 1, 1, 1), 0.9);
        let deltas = Array4::zeros((1, 6, 1, 1));
        assert!(matches!(
            layer.forward(scores.view(), deltas.view(), &info(100, 100)),
            Err(Error::Shape { name: "deltas", .. })
        ));

        // Delta channels don't match the single template.
        let deltas = Array4::zeros((1, 8, 1, 1));
        assert!(matches!(
            layer.forward(scores.view(), deltas.view(), &info(100, 100)),
            Err(Error::Shape { name: "deltas", .. })
        ));

        let scores = Array4::from_elem((1, 3, 1, 1), 0.9);
        let deltas = Array4::zeros((1, 4, 1, 1));
        assert!(matches!(
            layer.forward(scores.view(), deltas.view(), &info(100, 100)),
            Err(Error::Shape { name: "scores", .. })
        ));

        let scores = Array4::from_elem((1, 1, 2, 1), 0.9);
        assert!(matches!(
            layer.forward(scores.view(), deltas.view(), &info(100, 100)),
            Err(Error::Shape { name: "deltas", .. })
        ));
    }

    #[test]
    fn invalid_image_info() {
        let mut layer = ProposalLayer::new(config(), single_template());
        let scores = Array4::from_elem((1, 1, 1, 1), 0.9);
        let deltas = Array4::zeros((1, 4, 1, 1));

        for info in [
            ImageInfo::new(Resolution::new(100, 100), 0.0),
            // Would turn the minimum size negative.
            ImageInfo::new(Resolution::new(100, 100), -1.0),
            ImageInfo::new(Resolution::new(100, 100), f32::INFINITY),
            ImageInfo::new(Resolution::new(100, 0), 1.0),
        ] {
            assert!(matches!(
                layer.forward(scores.view(), deltas.view(), &info),
                Err(Error::ImageInfo(_))
            ));
        }
    }

    #[test]
    fn anchors_follow_feature_map_size() {
        let mut layer = ProposalLayer::new(
            ProposalConfig {
                nms_thresh: 1.0,
                ..config()
            },
            single_template(),
        );
        for width in [1, 3, 2] {
            let scores = Array4::from_elem((1, 1, 1, width), 0.5);
            let deltas = Array4::zeros((1, 4, 1, width));
            let proposals = layer
                .forward(scores.view(), deltas.view(), &info(100, 100))
                .unwrap();
            assert_eq!(proposals.len(), width);
            assert_eq!(
                proposals.rects()[width - 1],
                Rect::from_corners(16.0 * (width - 1) as f32, 0.0, 16.0 * width as f32 - 1.0, 15.0)
            );
        }
    }
}
