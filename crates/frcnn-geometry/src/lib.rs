//! Box geometry shared by the proposal and detection stages.
//!
//! All rectangles in this crate use *inclusive* pixel coordinates: a [`Rect`] spanning
//! `x1..=x2` covers `x2 - x1 + 1` pixel columns. This is the convention the regression targets
//! of Faster R-CNN style networks were trained with, so widths, heights, areas and the box delta
//! transform all carry the `+ 1`.

pub mod num;
pub mod rect;

mod resolution;

pub use rect::{Delta, Rect};
pub use resolution::Resolution;
