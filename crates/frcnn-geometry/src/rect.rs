//! Rectangle and box delta types.

use std::{fmt, ops::Div};

use approx::{AbsDiffEq, RelativeEq};

use crate::Resolution;

/// An axis-aligned box in corner form, using inclusive pixel coordinates.
///
/// The box covers the columns `x1..=x2` and the rows `y1..=y2`, so its width is `x2 - x1 + 1`.
/// Nothing is checked at construction: boxes produced by decoding garbage network outputs may be
/// degenerate (`x2 < x1 - 1`), and all operations on them stay arithmetically defined.
#[derive(Clone, Copy, PartialEq, Default)]
pub struct Rect {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl Rect {
    /// Creates a rectangle from its top-left and bottom-right (inclusive) corners.
    #[inline]
    pub const fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Creates a rectangle of `width x height` pixels centered at `(x_center, y_center)`.
    ///
    /// This is the inverse of [`Rect::center`] and [`Rect::width`]/[`Rect::height`].
    #[inline]
    pub fn from_center(x_center: f32, y_center: f32, width: f32, height: f32) -> Self {
        Self {
            x1: x_center - 0.5 * width,
            y1: y_center - 0.5 * height,
            x2: x_center + 0.5 * width - 1.0,
            y2: y_center + 0.5 * height - 1.0,
        }
    }

    /// Creates a rectangle from an `[x1, y1, x2, y2]` array.
    #[inline]
    pub fn from_array([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self::from_corners(x1, y1, x2, y2)
    }

    /// Returns the `[x1, y1, x2, y2]` coordinates of this rectangle.
    #[inline]
    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    #[inline]
    pub fn x1(&self) -> f32 {
        self.x1
    }

    #[inline]
    pub fn y1(&self) -> f32 {
        self.y1
    }

    #[inline]
    pub fn x2(&self) -> f32 {
        self.x2
    }

    #[inline]
    pub fn y2(&self) -> f32 {
        self.y2
    }

    /// Returns the number of pixel columns covered by `self` (`x2 - x1 + 1`).
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1 + 1.0
    }

    /// Returns the number of pixel rows covered by `self` (`y2 - y1 + 1`).
    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1 + 1.0
    }

    /// Returns the center point, as used by the box delta transform.
    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (
            self.x1 + 0.5 * self.width(),
            self.y1 + 0.5 * self.height(),
        )
    }

    /// Returns the number of pixels contained in `self`.
    #[inline]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Translates the rectangle by `(dx, dy)`.
    #[must_use]
    pub fn move_by(&self, dx: f32, dy: f32) -> Rect {
        Rect {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    /// Computes the number of pixels shared by `self` and `other`.
    ///
    /// Returns 0.0 if the rectangles do not overlap.
    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1) + 1.0;
        let h = self.y2.min(other.y2) - self.y1.max(other.y1) + 1.0;
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        w * h
    }

    /// Computes the Intersection over Union (IOU) of `self` and `other`.
    ///
    /// Non-overlapping and degenerate rectangles have an IOU of 0.0. The result is symmetric in
    /// its arguments.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Clamps all coordinates into an image of `width x height` pixels.
    ///
    /// X coordinates end up in `[0, width - 1]`, Y coordinates in `[0, height - 1]`.
    #[must_use]
    pub fn clip(&self, width: f32, height: f32) -> Rect {
        let clamp = |v: f32, bound: f32| f32::max(0.0, v.min(bound));
        let (xmax, ymax) = (width - 1.0, height - 1.0);
        Rect {
            x1: clamp(self.x1, xmax),
            y1: clamp(self.y1, ymax),
            x2: clamp(self.x2, xmax),
            y2: clamp(self.y2, ymax),
        }
    }

    /// Clamps all coordinates into an image of the given [`Resolution`].
    #[must_use]
    pub fn clip_to(&self, res: Resolution) -> Rect {
        self.clip(res.width() as f32, res.height() as f32)
    }

    /// Applies a (denormalized) regression [`Delta`] to `self`.
    ///
    /// The center is shifted by `dx * width`/`dy * height` and the size scaled by `exp(dw)`/
    /// `exp(dh)`. A zero delta reproduces `self` exactly.
    ///
    /// If `self` has a non-positive width or height, the result is a degenerate box; callers are
    /// expected to filter those out by size afterwards.
    #[must_use]
    pub fn transform(&self, delta: Delta) -> Rect {
        let (w, h) = (self.width(), self.height());
        let (xc, yc) = self.center();

        let pred_xc = delta.dx * w + xc;
        let pred_yc = delta.dy * h + yc;
        let pred_w = delta.dw.exp() * w;
        let pred_h = delta.dh.exp() * h;

        Rect::from_center(pred_xc, pred_yc, pred_w, pred_h)
    }

    /// Computes the (denormalized) [`Delta`] that transforms `self` into `target`.
    ///
    /// This is the inverse of [`Rect::transform`].
    pub fn delta_to(&self, target: &Rect) -> Delta {
        let (w, h) = (self.width(), self.height());
        let (xc, yc) = self.center();
        let (tw, th) = (target.width(), target.height());
        let (txc, tyc) = target.center();

        Delta {
            dx: (txc - xc) / w,
            dy: (tyc - yc) / h,
            dw: (tw / w).ln(),
            dh: (th / h).ln(),
        }
    }
}

/// Divides all coordinates by a scale factor, mapping a box from a resized image back into the
/// original image.
impl Div<f32> for Rect {
    type Output = Rect;

    fn div(self, scale: f32) -> Rect {
        Rect {
            x1: self.x1 / scale,
            y1: self.y1 / scale,
            x2: self.x2 / scale,
            y2: self.y2 / scale,
        }
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect ({},{})-({},{})",
            self.x1, self.y1, self.x2, self.y2
        )
    }
}

impl AbsDiffEq for Rect {
    type Epsilon = f32;

    fn default_epsilon() -> f32 {
        f32::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| a.abs_diff_eq(b, epsilon))
    }
}

impl RelativeEq for Rect {
    fn default_max_relative() -> f32 {
        f32::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: f32, max_relative: f32) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| a.relative_eq(b, epsilon, max_relative))
    }
}

/// Box regression offsets `(dx, dy, dw, dh)` for one anchor or ROI.
///
/// `dx`/`dy` move the center relative to the reference box size, `dw`/`dh` are log-space size
/// ratios.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Delta {
    pub dx: f32,
    pub dy: f32,
    pub dw: f32,
    pub dh: f32,
}

impl Delta {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    #[inline]
    pub const fn new(dx: f32, dy: f32, dw: f32, dh: f32) -> Self {
        Self { dx, dy, dw, dh }
    }

    #[inline]
    pub fn to_array(&self) -> [f32; 4] {
        [self.dx, self.dy, self.dw, self.dh]
    }
}

impl From<[f32; 4]> for Delta {
    fn from([dx, dy, dw, dh]: [f32; 4]) -> Self {
        Self { dx, dy, dw, dh }
    }
}

impl AbsDiffEq for Delta {
    type Epsilon = f32;

    fn default_epsilon() -> f32 {
        f32::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| a.abs_diff_eq(b, epsilon))
    }
}
