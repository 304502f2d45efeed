//! Conversion between boxes and normalized regression targets.

use frcnn_geometry::{Delta, Rect};

/// Encodes and decodes boxes relative to a reference box (an anchor or ROI).
///
/// Networks are usually trained on regression targets that were normalized per component with
/// `(target - mean) / std`. The coder undoes that normalization before applying a predicted
/// delta, and applies it when computing training targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    means: [f32; 4],
    stds: [f32; 4],
}

impl BoxCoder {
    /// A coder that uses raw deltas without any normalization.
    pub const IDENTITY: Self = Self {
        means: [0.0; 4],
        stds: [1.0; 4],
    };

    pub fn new(means: [f32; 4], stds: [f32; 4]) -> Self {
        Self { means, stds }
    }

    pub fn means(&self) -> [f32; 4] {
        self.means
    }

    pub fn stds(&self) -> [f32; 4] {
        self.stds
    }

    /// Applies a normalized network output `delta` to `reference`.
    pub fn decode(&self, reference: &Rect, delta: Delta) -> Rect {
        reference.transform(self.denormalize(delta))
    }

    /// Computes the normalized delta that [`BoxCoder::decode`] maps `reference` to `target` with.
    pub fn encode(&self, reference: &Rect, target: &Rect) -> Delta {
        self.normalize(reference.delta_to(target))
    }

    fn denormalize(&self, delta: Delta) -> Delta {
        let mut raw = delta.to_array();
        for (i, v) in raw.iter_mut().enumerate() {
            *v = *v * self.stds[i] + self.means[i];
        }
        Delta::from(raw)
    }

    fn normalize(&self, delta: Delta) -> Delta {
        let mut norm = delta.to_array();
        for (i, v) in norm.iter_mut().enumerate() {
            *v = (*v - self.means[i]) / self.stds[i];
        }
        Delta::from(norm)
    }
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::IDENTITY
    }
}
