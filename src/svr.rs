//! Spatially varying response (SVR) model of the display.
//!
//! The usable screen area is divided into a grid of square calibration patches.
//! Every patch stores the darkest and brightest radiance it can emit per channel
//! and an inverse response curve that turns a normalized radiance into the
//! drive value the display needs to emit it. Values between patch centers are
//! interpolated so neighbouring patches blend without visible seams.

use crate::{error::Error, image::RadianceImage};
use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Calibration data for one square patch of the display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Radiance emitted at drive value 0, per channel.
    pub min: [f32; 3],

    /// Radiance emitted at drive value 1, per channel.
    pub max: [f32; 3],

    /// Inverse response samples. Sample `i` is the drive value that emits
    /// `min + i / (len - 1) * (max - min)`.
    pub response: Vec<[f32; 3]>,
}

/// Which calibrated bound to interpolate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    Min,
    Max,
}

/// The patch grid and its geometry.
///
/// Pixel positions passed to the lookup functions are relative to the top left
/// corner of the usable area, i.e. the border is already removed.
#[derive(Clone, Debug, PartialEq)]
pub struct SvrInfo {
    patches: Vec<Patch>,
    layout: (usize, usize),
    patch_size: f64,
    screen_size: (f64, f64),
    border_size: (f64, f64),
    exposure: f64,
    color_transform: Matrix3<f32>,
}

impl SvrInfo {
    /// Build the model. `patches` are ordered row by row over `layout`.
    pub fn new(
        patches: Vec<Patch>,
        layout: (usize, usize),
        patch_size: f64,
        screen_size: (f64, f64),
        border_size: (f64, f64),
    ) -> Result<Self, Error> {
        if patches.len() != layout.0 * layout.1 || patches.is_empty() {
            return Err(Error::Calibration(format!(
                "expected {} patches for a {}x{} layout but got {}",
                layout.0 * layout.1,
                layout.0,
                layout.1,
                patches.len()
            )));
        }
        if let Some(i) = patches.iter().position(|p| p.response.is_empty()) {
            return Err(Error::Calibration(format!("patch {i} has an empty response curve")));
        }

        Ok(Self {
            patches,
            layout,
            patch_size,
            screen_size,
            border_size,
            exposure: 1.0,
            color_transform: Matrix3::identity(),
        })
    }

    pub fn with_exposure(mut self, exposure: f64) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_color_transform(mut self, color_transform: Matrix3<f32>) -> Self {
        self.color_transform = color_transform;
        self
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn layout(&self) -> (usize, usize) {
        self.layout
    }

    pub fn patch_size(&self) -> f64 {
        self.patch_size
    }

    pub fn screen_size(&self) -> (f64, f64) {
        self.screen_size
    }

    pub fn border_size(&self) -> (f64, f64) {
        self.border_size
    }

    /// Exposure time used while calibrating.
    pub fn exposure(&self) -> f64 {
        self.exposure
    }

    /// Camera to display color space matrix.
    pub fn color_transform(&self) -> &Matrix3<f32> {
        &self.color_transform
    }

    /// Size of the screen without its border, in (possibly fractional) pixels.
    pub fn usable_size(&self) -> (f64, f64) {
        (
            self.screen_size.0 - 2.0 * self.border_size.0,
            self.screen_size.1 - 2.0 * self.border_size.1,
        )
    }

    /// Check that the patch grid exactly tiles the usable area and that the patch
    /// size is even. Must run on the native calibration, before [`SvrInfo::rescale`].
    pub fn check_values(&self) -> Result<(), Error> {
        let patch = self.patch_size as i64;
        let usable_w = self.screen_size.0 as i64 - 2 * self.border_size.0 as i64;
        let usable_h = self.screen_size.1 as i64 - 2 * self.border_size.1 as i64;

        if patch <= 0 {
            return Err(Error::Calibration(format!(
                "patch size must be positive but is {}",
                self.patch_size
            )));
        }
        if usable_w % patch != 0
            || usable_h % patch != 0
            || usable_w / patch != self.layout.0 as i64
            || usable_h / patch != self.layout.1 as i64
        {
            return Err(Error::Calibration(format!(
                "usable area {usable_w}x{usable_h} does not split into {}x{} patches of {patch} pixels",
                self.layout.0, self.layout.1
            )));
        }
        if patch % 2 != 0 {
            return Err(Error::Calibration(format!(
                "patch size {patch} is not divisible by 2"
            )));
        }
        Ok(())
    }

    /// Scale the geometry to a virtual screen resolution.
    pub fn rescale(&mut self, scale: f64) {
        self.patch_size *= scale;
        self.border_size.0 *= scale;
        self.border_size.1 *= scale;
        self.screen_size.0 *= scale;
        self.screen_size.1 *= scale;
    }

    /// Repair every response curve so it is non-decreasing.
    ///
    /// Returns the number of samples that had to be changed.
    pub fn repair_monotonicity(&mut self) -> usize {
        self.patches
            .iter_mut()
            .map(|patch| check_monotonicity(&mut patch.response))
            .sum()
    }

    /// Drive value for `value` using only the curve of patch `index`.
    ///
    /// Below the patch minimum the display is off, above its maximum it is
    /// saturated. In between, the normalized value picks the nearest curve sample.
    pub fn lookup_response_subpixel(&self, value: f32, index: usize, channel: usize) -> f32 {
        let patch = &self.patches[index];
        let (min, max) = (patch.min[channel], patch.max[channel]);
        if value < min {
            return 0.0;
        }
        if value > max {
            return 1.0;
        }

        let last = patch.response.len() - 1;
        let fit = if max > min {
            (value - min) / (max - min)
        } else {
            1.0
        };
        let sample = ((fit * last as f32) + 0.5) as usize;
        patch.response[sample.min(last)][channel]
    }

    /// Drive value for `value` at screen position `(x, y)`, interpolated between patches.
    pub fn apply_response_svr_subpixel(&self, value: f32, x: f64, y: f64, channel: usize) -> f32 {
        self.interpolate(x, y, |index| {
            self.lookup_response_subpixel(value, index, channel)
        })
    }

    /// Achievable minimum or maximum radiance at `(x, y)`.
    pub fn get_min_max_subpixel(&self, x: f64, y: f64, channel: usize, bound: Bound) -> f32 {
        self.interpolate(x, y, |index| match bound {
            Bound::Min => self.patches[index].min[channel],
            Bound::Max => self.patches[index].max[channel],
        })
    }

    /// Per pixel achievable bound over a screen of `width` x `height` pixels.
    pub fn get_min_max_screen(&self, width: usize, height: usize, bound: Bound) -> RadianceImage {
        let pixels = (0..width * height)
            .into_par_iter()
            .map(|i| {
                let (x, y) = ((i % width) as f64, (i / width) as f64);
                [0, 1, 2].map(|c| self.get_min_max_subpixel(x, y, c, bound))
            })
            .collect();
        RadianceImage::from_pixels(width, height, pixels)
            .unwrap_or_else(|_| RadianceImage::new(width, height))
    }

    /// Replace every radiance value of a screen image by its interpolated drive value.
    pub fn apply_response_screen(&self, screen: &mut RadianceImage) {
        let width = screen.width().max(1);
        screen
            .pixels_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, px)| {
                let (x, y) = ((i % width) as f64, (i / width) as f64);
                for c in 0..3 {
                    px[c] = self.apply_response_svr_subpixel(px[c], x, y, c);
                }
            });
    }

    fn patch_index(&self, col: i64, row: i64) -> usize {
        let col = col.clamp(0, self.layout.0 as i64 - 1) as usize;
        let row = row.clamp(0, self.layout.1 as i64 - 1) as usize;
        row * self.layout.0 + col
    }

    /// Four way dispatch shared by the response and bound lookups.
    ///
    /// Pixels within half a patch of the left or right edge cannot be interpolated
    /// horizontally, and likewise for the top and bottom edge vertically.
    fn interpolate(&self, ix: f64, iy: f64, sample: impl Fn(usize) -> f32) -> f32 {
        let ps = self.patch_size;
        let half = ps / 2.0;
        let (w, h) = self.usable_size();

        let col = (ix / ps).floor() as i64;
        let row = (iy / ps).floor() as i64;
        let px = ix % ps;
        let py = iy % ps;

        let inner_x = ix >= half && ix <= w - 1.0 - half;
        let inner_y = iy >= half && iy <= h - 1.0 - half;

        let left = if px < half { col - 1 } else { col };
        let above = if py < half { row - 1 } else { row };
        let center = |i: i64| i as f64 * ps + half;

        match (inner_x, inner_y) {
            (false, false) => sample(self.patch_index(col, row)),
            (false, true) => {
                let v0 = sample(self.patch_index(col, above));
                let v1 = sample(self.patch_index(col, above + 1));
                interpolate_linear(iy, center(above), center(above + 1), v0, v1)
            }
            (true, false) => {
                let v0 = sample(self.patch_index(left, row));
                let v1 = sample(self.patch_index(left + 1, row));
                interpolate_linear(ix, center(left), center(left + 1), v0, v1)
            }
            (true, true) => {
                let top = interpolate_linear(
                    ix,
                    center(left),
                    center(left + 1),
                    sample(self.patch_index(left, above)),
                    sample(self.patch_index(left + 1, above)),
                );
                let bottom = interpolate_linear(
                    ix,
                    center(left),
                    center(left + 1),
                    sample(self.patch_index(left, above + 1)),
                    sample(self.patch_index(left + 1, above + 1)),
                );
                interpolate_linear(iy, center(above), center(above + 1), top, bottom)
            }
        }
    }
}

fn interpolate_linear(p: f64, p0: f64, p1: f64, v0: f32, v1: f32) -> f32 {
    let t = ((p - p0) / (p1 - p0)) as f32;
    v0 + (v1 - v0) * t
}

/// Make a response curve non-decreasing.
///
/// Walking backward from the second to last sample, any sample larger than its
/// successor is clamped down to the successor. Returns the number of changed values.
pub fn check_monotonicity(curve: &mut [[f32; 3]]) -> usize {
    let mut fixed = 0;
    for i in (0..curve.len().saturating_sub(1)).rev() {
        let mut repaired = false;
        for c in 0..3 {
            if curve[i][c] > curve[i + 1][c] {
                curve[i][c] = curve[i + 1][c];
                repaired = true;
                fixed += 1;
            }
        }
        if repaired {
            warn!(
                index = i,
                "response curve is not monotonic, copying successor {:?}",
                curve[i + 1]
            );
        }
    }
    fixed
}

/// Smallest max/min radiance ratio over all pixels and channels.
pub fn screen_dynamic_range(min: &RadianceImage, max: &RadianceImage) -> f32 {
    min.pixels()
        .iter()
        .zip(max.pixels())
        .flat_map(|(lo, hi)| (0..3).map(move |c| hi[c] / lo[c]))
        .fold(f32::INFINITY, f32::min)
}
