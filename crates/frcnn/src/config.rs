//! Stage configuration.
//!
//! Parsing configuration files is left to the driver; the structs in here hold already-resolved
//! values. Their [`Default`] impls use the usual test-time parameters of Faster R-CNN models.

use frcnn_geometry::Resolution;

use crate::{
    detection::{coder::BoxCoder, nms::SuppressionMode},
    error::ConfigError,
    image::ImageInfo,
};

/// Parameters of the [`ProposalLayer`][crate::detection::proposal::ProposalLayer].
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalConfig {
    /// Number of top-scoring candidates kept before suppression.
    pub pre_nms_top_n: usize,
    /// Maximum number of proposals emitted after suppression.
    pub post_nms_top_n: usize,
    /// IOU above which a lower-scoring candidate is suppressed.
    pub nms_thresh: f32,
    /// Minimum width and height of a proposal, in original image pixels.
    pub min_size: f32,
    /// Distance between feature map cells, in scaled image pixels.
    pub feat_stride: u32,
    /// Test-time speedup: candidates of anchor templates other than the first one are dropped
    /// when their score is below this threshold.
    ///
    /// This can drop true positives before suppression ever sees them, so it's off by default.
    pub score_thresh: Option<f32>,
    pub suppression: SuppressionMode,
}

impl ProposalConfig {
    /// Parameters used while training, where more proposals are kept for sampling.
    pub fn training() -> Self {
        Self {
            pre_nms_top_n: 12000,
            post_nms_top_n: 2000,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("pre_nms_top_n", self.pre_nms_top_n)?;
        positive("post_nms_top_n", self.post_nms_top_n)?;
        positive("feat_stride", self.feat_stride as usize)?;
        threshold("nms_thresh", self.nms_thresh)?;
        threshold("min_size", self.min_size)?;
        if let Some(thresh) = self.score_thresh {
            threshold("score_thresh", thresh)?;
        }
        self.suppression.validate()
    }
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            pre_nms_top_n: 6000,
            post_nms_top_n: 300,
            nms_thresh: 0.7,
            min_size: 16.0,
            feat_stride: 16,
            score_thresh: None,
            suppression: SuppressionMode::Greedy,
        }
    }
}

/// Parameters of the [`Detector`][crate::detection::detector::Detector].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// Number of classes the classifier distinguishes, including the background class 0.
    pub num_classes: usize,
    /// Minimum class score of a detection.
    pub score_thresh: f32,
    /// IOU threshold of the per-class suppression.
    pub nms_thresh: f32,
    pub suppression: SuppressionMode,
    /// When set, surviving boxes are replaced by the confidence-weighted average of all
    /// candidates overlapping them by at least this IOU.
    pub vote_thresh: Option<f32>,
    /// Means the regression targets were normalized with.
    pub bbox_means: [f32; 4],
    /// Standard deviations the regression targets were normalized with.
    pub bbox_stds: [f32; 4],
    /// Limits the number of detections per image, across all classes.
    pub max_per_image: Option<usize>,
    /// Number of classifier passes in iterative refinement mode. 0 disables it.
    pub cascade_iterations: u32,
    /// Target lengths of the shorter image side, one per test scale.
    pub scales: Vec<u32>,
    /// Maximum length of the longer image side after scaling.
    pub max_size: u32,
    /// Scaled images are zero-padded to a multiple of this. 0 disables padding.
    pub size_align: u32,
}

impl DetectionConfig {
    /// Creates the default configuration for a network with `num_classes` classes (including
    /// background).
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            ..Self::default()
        }
    }

    /// Returns the [`BoxCoder`] that undoes the regression target normalization.
    pub fn coder(&self) -> BoxCoder {
        BoxCoder::new(self.bbox_means, self.bbox_stds)
    }

    /// Computes the network input geometry of every configured test scale.
    pub fn image_infos(&self, original: Resolution) -> Vec<ImageInfo> {
        self.scales
            .iter()
            .map(|&target| ImageInfo::for_scale(original, target, self.max_size, self.size_align))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::NoForeground(self.num_classes));
        }
        threshold("score_thresh", self.score_thresh)?;
        threshold("nms_thresh", self.nms_thresh)?;
        if let Some(thresh) = self.vote_thresh {
            threshold("vote_thresh", thresh)?;
        }
        if let Some(max) = self.max_per_image {
            positive("max_per_image", max)?;
        }
        if self.bbox_stds.iter().any(|&std| std == 0.0 || !std.is_finite()) {
            return Err(ConfigError::Stds(self.bbox_stds));
        }
        if self.scales.is_empty() {
            return Err(ConfigError::NoScales);
        }
        for &scale in &self.scales {
            positive("scales", scale as usize)?;
        }
        positive("max_size", self.max_size as usize)?;
        if self.cascade_iterations > 0 {
            if self.scales.len() != 1 {
                return Err(ConfigError::CascadeScales(self.scales.len()));
            }
            if let SuppressionMode::Soft(_) = self.suppression {
                return Err(ConfigError::CascadeSuppression(self.suppression));
            }
            if self.vote_thresh.is_some() {
                return Err(ConfigError::CascadeVote);
            }
        }
        self.suppression.validate()
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            num_classes: 21,
            score_thresh: 0.05,
            nms_thresh: 0.3,
            suppression: SuppressionMode::Greedy,
            vote_thresh: None,
            bbox_means: [0.0; 4],
            bbox_stds: [1.0; 4],
            max_per_image: None,
            cascade_iterations: 0,
            scales: vec![600],
            max_size: 1000,
            size_align: 0,
        }
    }
}

fn positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NonPositive { name, value });
    }
    Ok(())
}

fn threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Threshold { name, value });
    }
    Ok(())
}
