//! Input image geometry.
//!
//! The network runs on a resized (and possibly padded) copy of the input image. The stages only
//! need to know the size of that copy and the factor it was resized by, which is what
//! [`ImageInfo`] carries.

use frcnn_geometry::Resolution;

use crate::error::{Error, Result};

/// Computes the factor an image of resolution `original` is resized by for a test scale.
///
/// The shorter side is scaled to `target_short`, unless that would make the longer side exceed
/// `max_long`, in which case the longer side is scaled to exactly `max_long`.
pub fn scale_factor(original: Resolution, target_short: u32, max_long: u32) -> f32 {
    let short = original.short_side() as f32;
    let long = original.long_side() as f32;

    let scale = target_short as f32 / short;
    if (scale * long).round() > max_long as f32 {
        max_long as f32 / long
    } else {
        scale
    }
}

/// Pads `res` up to the next multiple of `align` in both dimensions.
///
/// An `align` of 0 disables padding.
pub fn align_resolution(res: Resolution, align: u32) -> Resolution {
    if align == 0 {
        return res;
    }
    let up = |v: u32| v.div_ceil(align) * align;
    Resolution::new(up(res.width()), up(res.height()))
}

/// Size of the network input image and the factor it was scaled by.
///
/// This corresponds to the `[height, width, scale]` image info triple fed into Faster R-CNN
/// networks alongside the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo {
    resolution: Resolution,
    scale: f32,
}

impl ImageInfo {
    pub fn new(resolution: Resolution, scale: f32) -> Self {
        Self { resolution, scale }
    }

    /// Computes the network input geometry of an image of resolution `original` for one test
    /// scale.
    pub fn for_scale(original: Resolution, target_short: u32, max_long: u32, align: u32) -> Self {
        let scale = scale_factor(original, target_short, max_long);
        let scaled = Resolution::new(
            (original.width() as f32 * scale).round() as u32,
            (original.height() as f32 * scale).round() as u32,
        );
        let resolution = align_resolution(scaled, align);
        log::trace!("{original} -> {scaled} (x{scale}), padded to {resolution}");
        Self { resolution, scale }
    }

    /// Parses an image info triple `[height, width, scale]`.
    pub fn from_slice(info: &[f32]) -> Result<Self> {
        match *info {
            [height, width, scale]
                if [height, width, scale]
                    .iter()
                    .all(|v| v.is_finite() && *v > 0.0) =>
            {
                Ok(Self {
                    resolution: Resolution::new(width as u32, height as u32),
                    scale,
                })
            }
            _ => Err(Error::ImageInfo(info.to_vec())),
        }
    }

    /// Checks that the resolution is non-empty and the scale factor is positive and finite.
    ///
    /// The stages reject every [`ImageInfo`] that fails this check.
    pub fn validate(&self) -> Result<()> {
        let valid = self.resolution.num_pixels() > 0 && self.scale.is_finite() && self.scale > 0.0;
        if !valid {
            return Err(Error::ImageInfo(self.to_array().to_vec()));
        }
        Ok(())
    }

    /// Returns the `[height, width, scale]` triple.
    pub fn to_array(&self) -> [f32; 3] {
        [self.height(), self.width(), self.scale]
    }

    /// Resolution of the (padded) network input image.
    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.resolution.width() as f32
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.resolution.height() as f32
    }

    /// Factor the original image was resized by.
    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn scales_short_side() {
        let res = Resolution::new(500, 375);
        assert_relative_eq!(scale_factor(res, 600, 1000), 1.6);
    }

    #[test]
    fn long_side_is_capped() {
        // 600 / 200 = 3 would make the long side 2400.
        let res = Resolution::new(800, 200);
        assert_relative_eq!(scale_factor(res, 600, 1000), 1.25);

        let info = ImageInfo::for_scale(res, 600, 1000, 0);
        assert_eq!(info.resolution(), Resolution::new(1000, 250));
    }

    #[test]
    fn alignment_pads_up() {
        assert_eq!(
            align_resolution(Resolution::new(600, 801), 32),
            Resolution::new(608, 832)
        );
        assert_eq!(
            align_resolution(Resolution::new(640, 480), 32),
            Resolution::new(640, 480)
        );
        assert_eq!(
            align_resolution(Resolution::new(601, 3), 0),
            Resolution::new(601, 3)
        );

        let info = ImageInfo::for_scale(Resolution::new(500, 375), 600, 1000, 32);
        assert_eq!(info.resolution(), Resolution::new(800, 608));
    }

    #[test]
    fn parses_triple() {
        let info = ImageInfo::from_slice(&[600.0, 800.0, 1.6]).unwrap();
        assert_eq!(info.resolution(), Resolution::new(800, 600));
        assert_eq!(info.to_array(), [600.0, 800.0, 1.6]);

        assert!(ImageInfo::from_slice(&[600.0, 800.0]).is_err());
        assert!(ImageInfo::from_slice(&[600.0, 800.0, 0.0]).is_err());
        assert!(ImageInfo::from_slice(&[f32::NAN, 800.0, 1.0]).is_err());
    }

    #[test]
    fn validate() {
        let res = Resolution::new(100, 100);
        ImageInfo::new(res, 1.6).validate().unwrap();

        for scale in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                ImageInfo::new(res, scale).validate(),
                Err(Error::ImageInfo(_))
            ));
        }
        assert!(ImageInfo::new(Resolution::new(0, 100), 1.0)
            .validate()
            .is_err());
    }
}
