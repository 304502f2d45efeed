//! Bounding box voting.
//!
//! After suppression, each surviving box is replaced by the confidence-weighted average of all
//! pre-suppression candidates of its class that overlap it sufficiently. This smooths out the
//! localization error of any single box.

use frcnn_geometry::Rect;
use itertools::Itertools;

use super::Detection;

/// Refines the boxes of `survivors` by averaging the overlapping `candidates`.
///
/// Every candidate of the same class whose IOU with a survivor is at least `iou_thresh`
/// contributes its corners, weighted by its confidence. Survivors keep their own confidence and
/// class. A survivor without any contributing weight is left unchanged.
///
/// `candidates` must be the unsuppressed detections; since Soft-NMS modifies confidences in
/// place, callers have to keep a copy from before suppression.
pub fn vote(survivors: &mut [Detection], candidates: &[Detection], iou_thresh: f32) {
    for survivor in survivors {
        let rect = survivor.bounding_rect();

        let mut acc = [0.0; 4];
        let mut divisor = 0.0;
        for candidate in candidates {
            if candidate.class() != survivor.class()
                || rect.iou(&candidate.bounding_rect()) < iou_thresh
            {
                continue;
            }

            let factor = candidate.confidence();
            divisor += factor;
            for (acc, coord) in acc
                .iter_mut()
                .zip_eq(candidate.bounding_rect().to_array())
            {
                *acc += coord * factor;
            }
        }

        if divisor > 0.0 {
            survivor.set_bounding_rect(Rect::from_array(acc.map(|v| v / divisor)));
        }
    }
}
