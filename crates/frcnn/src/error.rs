//! Error types.
//!
//! Two kinds of problems are distinguished:
//!
//! - [`ConfigError`]s describe unusable parameters (non-positive top-N limits, mismatched class
//!   counts, a zero Gaussian sigma, ...). The stages never fail because of them: they log a
//!   warning and return an empty result, so that a driver processing a long list of images keeps
//!   running.
//! - [`Error`]s describe inputs that can't be indexed safely (wrong batch size, channel counts
//!   that don't match the anchor set). These abort the current call.

use thiserror::Error;

use crate::detection::nms::SuppressionMode;

/// Result type used by the detection stages.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fatal problem with the inputs of a stage.
#[derive(Debug, Error)]
pub enum Error {
    /// Only single-image batches are supported.
    #[error("only single-image batches are supported, got `{name}` with batch size {batch}")]
    BatchSize { name: &'static str, batch: usize },

    /// An input array does not have the shape the stage expects.
    #[error("`{name}` has shape {actual:?}, expected {expected}")]
    Shape {
        name: &'static str,
        actual: Vec<usize>,
        expected: String,
    },

    /// An ROI refers to an image other than batch index 0.
    #[error("ROI #{index} has batch index {batch}, only single-image batches are supported")]
    RoiBatchIndex { index: usize, batch: f32 },

    /// The image info triple is malformed.
    #[error("image info must be `[height, width, scale]` with positive entries, got {0:?}")]
    ImageInfo(Vec<f32>),

    /// Rerunning the network on refined ROIs failed.
    #[error("failed to rerun the classifier on refined ROIs")]
    Refine(#[source] anyhow::Error),
}

impl Error {
    pub(crate) fn shape(name: &'static str, actual: &[usize], expected: impl Into<String>) -> Self {
        Self::Shape {
            name,
            actual: actual.to_vec(),
            expected: expected.into(),
        }
    }
}

/// An unusable configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{name}` must be positive, got {value}")]
    NonPositive { name: &'static str, value: usize },

    #[error("gaussian soft-NMS requires a positive, finite sigma, got {0}")]
    Sigma(f32),

    #[error("`{name}` must be a finite, non-negative threshold, got {value}")]
    Threshold { name: &'static str, value: f32 },

    #[error("network outputs {actual} classes, but {expected} are configured")]
    ClassCount { expected: usize, actual: usize },

    #[error("bounding box normalization stds must be non-zero, got {0:?}")]
    Stds([f32; 4]),

    #[error("no test scales configured")]
    NoScales,

    #[error("{expected} test scales are configured, but outputs for {actual} scales were passed")]
    ScaleCount { expected: usize, actual: usize },

    #[error("iterative refinement only supports a single test scale, {0} are configured")]
    CascadeScales(usize),

    #[error("iterative refinement only supports greedy suppression, got {0:?}")]
    CascadeSuppression(SuppressionMode),

    #[error("box voting can't be combined with iterative refinement")]
    CascadeVote,

    #[error("{0} refinement passes are configured, use `Detector::detect_iterative`")]
    CascadeConfigured(u32),

    #[error("no anchor templates configured")]
    NoAnchors,

    #[error("anchor template coordinates must come in groups of 4, got {0} values")]
    AnchorCoords(usize),

    #[error("at least one class besides background is required, got {0} classes")]
    NoForeground(usize),
}
