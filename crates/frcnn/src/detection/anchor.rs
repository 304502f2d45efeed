//! Anchor generation for region proposal networks.
//!
//! A region proposal network predicts, for every cell of its feature map, one objectness score
//! and one box delta per anchor template. The templates are boxes centered on the first cell; the
//! anchors of any other cell are the templates shifted by the cell offset times the feature
//! stride.

use std::ops::Index;

use frcnn_geometry::{Rect, Resolution};

use crate::error::ConfigError;

/// The set of anchor boxes centered on feature map cell `(0, 0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorTemplates {
    rects: Vec<Rect>,
}

impl AnchorTemplates {
    pub fn new(rects: Vec<Rect>) -> Self {
        Self { rects }
    }

    /// Enumerates the classic aspect-ratio × scale template set.
    ///
    /// A `base_size`-pixel square is first reshaped to every aspect ratio (height / width) while
    /// keeping its area, then each of those boxes is scaled by every scale factor. Ratios form the
    /// outer loop, scales the inner one.
    ///
    /// `generate(16.0, &[0.5, 1.0, 2.0], &[8.0, 16.0, 32.0])` yields the 9 anchors most Faster
    /// R-CNN models are trained with.
    pub fn generate(base_size: f32, ratios: &[f32], scales: &[f32]) -> Self {
        let center = 0.5 * (base_size - 1.0);
        let area = base_size * base_size;

        let mut rects = Vec::with_capacity(ratios.len() * scales.len());
        for &ratio in ratios {
            let w = (area / ratio).sqrt().round();
            let h = (w * ratio).round();
            for &scale in scales {
                let half_w = 0.5 * (w * scale - 1.0);
                let half_h = 0.5 * (h * scale - 1.0);
                rects.push(Rect::from_corners(
                    center - half_w,
                    center - half_h,
                    center + half_w,
                    center + half_h,
                ));
            }
        }

        Self { rects }
    }

    /// Parses a flat `[x1, y1, x2, y2, x1, y1, ...]` coordinate list, as found in model
    /// configuration files.
    pub fn from_flat(coords: &[f32]) -> Result<Self, ConfigError> {
        if coords.is_empty() {
            return Err(ConfigError::NoAnchors);
        }
        if coords.len() % 4 != 0 {
            return Err(ConfigError::AnchorCoords(coords.len()));
        }

        let rects = coords
            .chunks_exact(4)
            .map(|c| Rect::from_corners(c[0], c[1], c[2], c[3]))
            .collect();
        Ok(Self { rects })
    }

    /// Returns the number of templates, which is the number of anchors per feature map cell.
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn as_slice(&self) -> &[Rect] {
        &self.rects
    }
}

impl Default for AnchorTemplates {
    fn default() -> Self {
        Self::generate(16.0, &[0.5, 1.0, 2.0], &[8.0, 16.0, 32.0])
    }
}

/// All anchors of a feature map.
///
/// Anchors are stored row-major over feature map cells, with the template index varying fastest:
/// the anchor of template `k` at cell `(row, col)` has index `(row * width + col) * A + k`.
#[derive(Debug, Clone)]
pub struct Anchors {
    anchors: Vec<Rect>,
    feature_map: Resolution,
    stride: u32,
    per_cell: usize,
}

impl Anchors {
    pub fn calculate(templates: &AnchorTemplates, feature_map: Resolution, stride: u32) -> Self {
        let per_cell = templates.len();
        let mut anchors = Vec::with_capacity(feature_map.num_pixels() as usize * per_cell);

        for row in 0..feature_map.height() {
            let dy = (row * stride) as f32;
            for col in 0..feature_map.width() {
                let dx = (col * stride) as f32;
                for template in templates.as_slice() {
                    anchors.push(template.move_by(dx, dy));
                }
            }
        }

        Self {
            anchors,
            feature_map,
            stride,
            per_cell,
        }
    }

    /// Returns the anchor of template `k` centered on feature map cell `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize, k: usize) -> Rect {
        self.anchors[(row * self.feature_map.width() as usize + col) * self.per_cell + k]
    }

    /// Returns the total number of anchors.
    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn feature_map(&self) -> Resolution {
        self.feature_map
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rect> {
        self.anchors.iter()
    }
}

impl Index<usize> for Anchors {
    type Output = Rect;

    fn index(&self, index: usize) -> &Rect {
        &self.anchors[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_templates() {
        let templates = AnchorTemplates::default();
        let expected = [
            [-84.0, -40.0, 99.0, 55.0],
            [-176.0, -88.0, 191.0, 103.0],
            [-360.0, -184.0, 375.0, 199.0],
            [-56.0, -56.0, 71.0, 71.0],
            [-120.0, -120.0, 135.0, 135.0],
            [-248.0, -248.0, 263.0, 263.0],
            [-36.0, -80.0, 51.0, 95.0],
            [-80.0, -168.0, 95.0, 183.0],
            [-168.0, -344.0, 183.0, 359.0],
        ];
        let actual = templates
            .as_slice()
            .iter()
            .map(|r| r.to_array())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn flat_coordinates() {
        let templates = AnchorTemplates::from_flat(&[0.0, 0.0, 15.0, 15.0, -8.0, -8.0, 23.0, 23.0])
            .unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(
            templates.as_slice()[1],
            Rect::from_corners(-8.0, -8.0, 23.0, 23.0)
        );

        assert_eq!(AnchorTemplates::from_flat(&[]), Err(ConfigError::NoAnchors));
        assert_eq!(
            AnchorTemplates::from_flat(&[0.0, 0.0, 15.0]),
            Err(ConfigError::AnchorCoords(3))
        );
    }

    #[test]
    fn grid_order_and_shift() {
        let templates = AnchorTemplates::from_flat(&[0.0, 0.0, 15.0, 15.0, -8.0, -8.0, 23.0, 23.0])
            .unwrap();
        let anchors = Anchors::calculate(&templates, Resolution::new(3, 2), 16);
        assert_eq!(anchors.anchor_count(), 3 * 2 * 2);

        // Template index varies fastest, then column, then row.
        assert_eq!(anchors[0], Rect::from_corners(0.0, 0.0, 15.0, 15.0));
        assert_eq!(anchors[1], Rect::from_corners(-8.0, -8.0, 23.0, 23.0));
        assert_eq!(anchors[2], Rect::from_corners(16.0, 0.0, 31.0, 15.0));
        assert_eq!(anchors[6], Rect::from_corners(0.0, 16.0, 15.0, 31.0));

        for row in 0..2 {
            for col in 0..3 {
                for k in 0..2 {
                    assert_eq!(
                        anchors.get(row, col, k),
                        anchors[(row * 3 + col) * 2 + k],
                    );
                    assert_eq!(
                        anchors.get(row, col, k),
                        templates.as_slice()[k].move_by(col as f32 * 16.0, row as f32 * 16.0),
                    );
                }
            }
        }
    }
}
