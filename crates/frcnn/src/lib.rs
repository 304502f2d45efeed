//! Post-processing for two-stage (Faster R-CNN style) object detectors.
//!
//! The network itself is not part of this crate. Its raw outputs go in, boxes come out:
//!
//! 1. The [`ProposalLayer`] turns the region proposal network's objectness scores and box deltas
//!    into a bounded list of class-agnostic regions of interest (ROIs).
//! 2. The driver runs the classification head on those ROIs.
//! 3. The [`Detector`] turns per-ROI class scores and class-specific deltas into final,
//!    class-labeled [`Detections`] in original image coordinates. It can fuse the outputs of
//!    several test scales, refine boxes by voting, and run iterative (cascade) refinement.
//!
//! # Coordinates
//!
//! Boxes use inclusive pixel corners `(x1, y1, x2, y2)`, so a box from `x1 = 0` to `x2 = 9` is 10
//! pixels wide. See [`Rect`].
//!
//! # Errors
//!
//! Invalid configuration makes the stages log a warning and return an empty result. Inputs that
//! can't be indexed safely are reported as [`Error`]s. See the [`error`] module.
//!
//! [`ProposalLayer`]: detection::proposal::ProposalLayer
//! [`Detector`]: detection::detector::Detector
//! [`Detections`]: detection::Detections

use log::LevelFilter;

pub mod config;
pub mod detection;
pub mod error;
pub mod image;
pub mod timer;

pub use error::{ConfigError, Error, Result};
pub use frcnn_geometry::{num, Delta, Rect, Resolution};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and this crate will log at *trace*
/// level. Otherwise, they will log at *debug* level. `RUST_LOG` can override both.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
