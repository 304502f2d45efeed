//! Non-Maximum Suppression.
//!
//! Region proposal networks and classification heads both produce many overlapping boxes for the
//! same object. Non-Maximum Suppression (NMS) filters these duplicates out, leaving only the most
//! confident box for each object.
//!
//! This module implements 2 variants of NMS, selected with [`SuppressionMode`]: classic greedy
//! NMS, which removes every box overlapping a more confident one ([`SuppressionMode::Greedy`]),
//! and Soft-NMS ([`SuppressionMode::Soft`]), which instead decays the confidence of overlapping
//! boxes and only drops them once it gets negligible.

use std::cmp::Reverse;

use frcnn_geometry::num::TotalF32;

use crate::error::ConfigError;

use super::Detection;

/// A non-maximum suppression algorithm.
#[derive(Debug, Clone)]
pub struct NonMaxSuppression {
    iou_thresh: f32,
    mode: SuppressionMode,
    limit: Option<usize>,
    score_thresh: f32,
    score_floor: f32,
    suppressed: Vec<bool>,
    out_buf: Vec<Detection>,
}

impl NonMaxSuppression {
    /// The default intersection-over-union threshold used to determine if two detections overlap.
    pub const DEFAULT_IOU_THRESH: f32 = 0.3;

    /// Soft-NMS discards boxes once their decayed confidence drops below this value.
    pub const SOFT_SCORE_FLOOR: f32 = 0.001;

    /// Creates a new non-maximum suppressor.
    ///
    /// The returned suppression algorithm will use [`SuppressionMode::Greedy`], a default IOU
    /// threshold, and neither an output limit nor a minimum output confidence.
    pub fn new() -> Self {
        Self {
            iou_thresh: Self::DEFAULT_IOU_THRESH,
            mode: SuppressionMode::Greedy,
            limit: None,
            score_thresh: f32::NEG_INFINITY,
            score_floor: Self::SOFT_SCORE_FLOOR,
            suppressed: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    /// Sets the intersection-over-union threshold to consider two detections as overlapping.
    ///
    /// Detections overlap when their IOU is strictly greater than this threshold. By default,
    /// [`Self::DEFAULT_IOU_THRESH`] is used.
    pub fn set_iou_thresh(&mut self, iou_thresh: f32) {
        self.iou_thresh = iou_thresh;
    }

    /// Sets the suppression mode.
    pub fn set_mode(&mut self, mode: SuppressionMode) {
        self.mode = mode;
    }

    /// Limits the number of detections returned by [`NonMaxSuppression::process`].
    ///
    /// Suppression stops as soon as the limit is reached, so this also saves work.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Sets the minimum confidence of returned detections.
    ///
    /// Since detections are selected in order of decreasing confidence, selection stops at the
    /// first detection below this value.
    pub fn set_score_thresh(&mut self, score_thresh: f32) {
        self.score_thresh = score_thresh;
    }

    /// Sets the confidence below which Soft-NMS discards a decayed detection.
    ///
    /// By default, [`Self::SOFT_SCORE_FLOOR`] is used. Has no effect in greedy mode.
    pub fn set_score_floor(&mut self, score_floor: f32) {
        self.score_floor = score_floor;
    }

    pub fn iou_thresh(&self) -> f32 {
        self.iou_thresh
    }

    pub fn mode(&self) -> SuppressionMode {
        self.mode
    }

    /// Performs non-maximum suppression on `detections`.
    ///
    /// `detections` is drained in the process (Soft-NMS decays confidences in place, so callers
    /// that need the original values have to keep a copy). The selected detections are returned
    /// as an iterator, in selection order, which is order of decreasing confidence.
    pub fn process(
        &mut self,
        detections: &mut Vec<Detection>,
    ) -> impl Iterator<Item = Detection> + '_ {
        self.out_buf.clear();

        match self.mode {
            SuppressionMode::Greedy => self.greedy(detections),
            SuppressionMode::Soft(decay) => self.soft(detections, decay),
        }

        detections.clear();
        self.out_buf.drain(..)
    }

    fn limit_reached(&self) -> bool {
        self.limit.map_or(false, |limit| self.out_buf.len() >= limit)
    }

    fn greedy(&mut self, detections: &mut [Detection]) {
        // Stable sort: equally confident detections keep their input order.
        detections.sort_by_key(|det| Reverse(TotalF32(det.confidence)));

        self.suppressed.clear();
        self.suppressed.resize(detections.len(), false);

        for i in 0..detections.len() {
            if self.limit_reached() {
                break;
            }
            if self.suppressed[i] {
                continue;
            }

            let seed = &detections[i];
            if seed.confidence < self.score_thresh {
                break;
            }

            let seed_rect = seed.bounding_rect();
            for (other, suppressed) in detections[i + 1..]
                .iter()
                .zip(&mut self.suppressed[i + 1..])
            {
                if !*suppressed && seed_rect.iou(&other.bounding_rect()) > self.iou_thresh {
                    *suppressed = true;
                }
            }

            self.out_buf.push(seed.clone());
        }
    }

    fn soft(&mut self, detections: &mut [Detection], decay: Decay) {
        // `detections[cur..n]` are the remaining candidates.
        let mut n = detections.len();
        let mut cur = 0;
        while cur < n && !self.limit_reached() {
            // The first maximum wins ties.
            let mut max_pos = cur;
            for i in cur + 1..n {
                if detections[max_pos].confidence < detections[i].confidence {
                    max_pos = i;
                }
            }
            detections.swap(cur, max_pos);

            let seed_rect = detections[cur].bounding_rect();
            let mut i = cur + 1;
            while i < n {
                let iou = seed_rect.iou(&detections[i].bounding_rect());
                detections[i].confidence *= decay.weight(iou, self.iou_thresh);

                if detections[i].confidence < self.score_floor {
                    // Discard by moving it past the end; the swapped-in box is examined next.
                    detections.swap(i, n - 1);
                    n -= 1;
                } else {
                    i += 1;
                }
            }

            if detections[cur].confidence < self.score_thresh {
                break;
            }
            self.out_buf.push(detections[cur].clone());
            cur += 1;
        }
    }
}

impl Default for NonMaxSuppression {
    fn default() -> Self {
        Self::new()
    }
}

/// Describes how [`NonMaxSuppression`] should deal with overlapping detections.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SuppressionMode {
    /// Remove overlapping detections, only retain the detection with highest confidence score.
    #[default]
    Greedy,

    /// Decay the confidence of overlapping detections (Soft-NMS).
    Soft(Decay),
}

impl SuppressionMode {
    /// Soft-NMS with Gaussian decay and the customary `sigma` of 0.5.
    pub const SOFT_GAUSSIAN: Self = Self::Soft(Decay::Gaussian {
        sigma: Decay::DEFAULT_SIGMA,
    });

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Soft(Decay::Gaussian { sigma }) if !(sigma.is_finite() && sigma > 0.0) => {
                Err(ConfigError::Sigma(sigma))
            }
            _ => Ok(()),
        }
    }
}

/// Confidence decay function of Soft-NMS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decay {
    /// Overlapping detections (`iou > thresh`) are scaled by `1 - iou`.
    Linear,
    /// All detections are scaled by `exp(-iou² / sigma)`, regardless of the IOU threshold.
    Gaussian { sigma: f32 },
    /// Overlapping detections are discarded, like greedy NMS does.
    Hard,
}

impl Decay {
    pub const DEFAULT_SIGMA: f32 = 0.5;

    /// Returns the factor a detection overlapping the selected one by `iou` is scaled by.
    pub fn weight(&self, iou: f32, iou_thresh: f32) -> f32 {
        match *self {
            Decay::Linear if iou > iou_thresh => 1.0 - iou,
            Decay::Linear => 1.0,
            Decay::Gaussian { sigma } => (-(iou * iou) / sigma).exp(),
            Decay::Hard if iou > iou_thresh => 0.0,
            Decay::Hard => 1.0,
        }
    }
}
