//! Proposal generation, suppression and detection decoding.
//!
//! The two stages of the detector live in [`proposal`] (dense anchor grid → bounded proposal set)
//! and [`detector`] (per-class classifier outputs → final detections). Both build on
//! [`anchor`], [`coder`], [`nms`] and [`vote`].

pub mod anchor;
pub mod coder;
pub mod detector;
pub mod nms;
pub mod proposal;
pub mod vote;

use std::cmp::Reverse;

use frcnn_geometry::{num::TotalF32, Rect};
use itertools::Itertools;
use ndarray::Array2;

/// A detected object: a bounding box, a confidence value and an object class.
///
/// Class 0 is the background class. The detector never emits background detections; the
/// proposal stage uses class 0 for its class-agnostic candidates.
///
/// The confidence is mutable since soft non-maximum suppression decays it in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    confidence: f32,
    class: u32,
    rect: Rect,
}

impl Detection {
    pub fn new(class: u32, confidence: f32, rect: Rect) -> Self {
        Self {
            confidence,
            class,
            rect,
        }
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = confidence;
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    /// Returns the axis-aligned bounding rectangle containing the detected object.
    pub fn bounding_rect(&self) -> Rect {
        self.rect
    }

    pub fn set_bounding_rect(&mut self, rect: Rect) {
        self.rect = rect;
    }
}

/// A collection of per-class object detections.
///
/// Iteration always yields detections grouped by ascending class id.
#[derive(Debug, Clone, Default)]
pub struct Detections {
    vec: Vec<Vec<Detection>>,
}

impl Detections {
    pub fn new() -> Self {
        Self { vec: Vec::new() }
    }

    /// Returns the total number of detections across all object classes.
    pub fn len(&self) -> usize {
        self.vec.iter().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.iter().all(|v| v.is_empty())
    }

    pub fn clear(&mut self) {
        for class in &mut self.vec {
            class.clear();
        }
    }

    pub fn push(&mut self, detection: Detection) {
        let raw_class = detection.class as usize;
        if self.vec.len() <= raw_class {
            self.vec.resize_with(raw_class + 1, Vec::new);
        }

        self.vec[raw_class].push(detection);
    }

    /// Returns an iterator yielding all detections, ordered by class.
    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.vec.iter().flat_map(|v| v.iter())
    }

    /// Returns an iterator that yields all detections of the given class.
    pub fn for_class(&self, class: u32) -> impl Iterator<Item = &Detection> {
        self.vec
            .get(class as usize)
            .into_iter()
            .flat_map(|v| v.iter())
    }

    /// Returns the per-class buckets, indexed by class id.
    pub(crate) fn classes_mut(&mut self) -> impl Iterator<Item = (u32, &mut Vec<Detection>)> {
        self.vec
            .iter_mut()
            .enumerate()
            .map(|(class, v)| (class as u32, v))
    }

    pub fn retain(&mut self, mut f: impl FnMut(&Detection) -> bool) {
        for class in &mut self.vec {
            class.retain(&mut f);
        }
    }

    /// Limits the number of detections across all classes to roughly `max`.
    ///
    /// This determines the confidence of the `max`-th most confident detection and drops every
    /// detection below it. Detections tied with that cutoff are all kept, so the result can
    /// contain more than `max` entries.
    pub fn limit_per_image(&mut self, max: usize) {
        if max == 0 {
            self.clear();
            return;
        }
        if self.len() <= max {
            return;
        }

        let cutoff = self
            .iter()
            .map(|det| Reverse(TotalF32(det.confidence)))
            .k_smallest(max)
            .last()
            .map(|Reverse(TotalF32(conf))| conf);
        if let Some(cutoff) = cutoff {
            log::trace!("per-image confidence cutoff for {max} detections: {cutoff}");
            self.retain(|det| det.confidence >= cutoff);
        }
    }

    /// Flattens the collection into a single list, ordered by class.
    pub fn into_vec(self) -> Vec<Detection> {
        self.vec.into_iter().flatten().collect()
    }
}

impl Extend<Detection> for Detections {
    fn extend<T: IntoIterator<Item = Detection>>(&mut self, iter: T) {
        for det in iter {
            self.push(det);
        }
    }
}

impl FromIterator<Detection> for Detections {
    fn from_iter<T: IntoIterator<Item = Detection>>(iter: T) -> Self {
        let mut detections = Detections::new();
        detections.extend(iter);
        detections
    }
}

/// Builds an `[N, 5]` ROI array (`[batch_index, x1, y1, x2, y2]` rows, batch index 0).
pub(crate) fn roi_array<I>(rects: I) -> Array2<f32>
where
    I: IntoIterator<Item = Rect>,
    I::IntoIter: ExactSizeIterator,
{
    let rects = rects.into_iter();
    let mut rois = Array2::zeros((rects.len(), 5));
    for (mut row, rect) in rois.rows_mut().into_iter().zip_eq(rects) {
        for (dst, coord) in row.iter_mut().skip(1).zip(rect.to_array()) {
            *dst = coord;
        }
    }
    rois
}
