//! Range maximizing decomposition of a radiance image into LDR frames.
//!
//! The display can add at most `max - min` radiance per pixel and frame. A pixel
//! that needs more than that is saturated in as many leading frames as necessary
//! and gets the remainder, converted through the inverse response, in the next one:
//!
//! ```text
//! required  2.5 x ceiling
//! frame     0     1     2     3
//!           1.0   1.0   r(.5) 0
//! ```

use crate::{error::Error, image::RadianceImage, svr::SvrInfo};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Frames of one HDR exposure, in display order.
#[derive(Clone, Debug, PartialEq)]
pub struct HdrSequence {
    pub frames: Vec<RadianceImage>,

    /// Factor applied to the required radiance before splitting it.
    pub scale: f64,

    /// Whether `scale` was chosen automatically.
    pub auto_scaled: bool,
}

/// Parameters of the decomposition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HdrSequencer {
    frames: usize,
    scale: Option<f64>,
    blur: f64,
    upscale: Option<(usize, usize)>,
}

impl HdrSequencer {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            scale: None,
            blur: 0.0,
            upscale: None,
        }
    }

    /// Use a fixed radiance scale instead of the automatic one.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Blur every frame with a kernel spanning `blur` of the frame height.
    pub fn with_blur(mut self, blur: f64) -> Self {
        self.blur = blur;
        self
    }

    /// Resize the frames to the given panel resolution.
    pub fn with_upscale(mut self, width: usize, height: usize) -> Self {
        self.upscale = Some((width, height));
        self
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn scale(&self) -> Option<f64> {
        self.scale
    }

    /// Scale that makes the most demanding pixel use exactly all frames.
    ///
    /// Pixels the display cannot light at all are ignored. Falls back to 1 if
    /// nothing is required.
    pub fn auto_scale(&self, required: &RadianceImage, ceiling: &RadianceImage) -> f64 {
        let demand = required
            .pixels()
            .par_iter()
            .zip(ceiling.pixels().par_iter())
            .map(|(r, m)| {
                (0..3)
                    .filter(|&c| m[c] > 0.0)
                    .map(|c| r[c] / m[c])
                    .fold(f32::NEG_INFINITY, f32::max)
            })
            .reduce(|| f32::NEG_INFINITY, f32::max) as f64;

        if demand > 0.0 && demand.is_finite() {
            self.frames as f64 / demand
        } else {
            1.0
        }
    }

    /// Split `required` into frames of drive values.
    ///
    /// `min_light` and `ceiling` are the per pixel black level and usable range
    /// (`max - min`) of the display on the same pixel grid as `required`.
    pub fn decompose(
        &self,
        required: &RadianceImage,
        min_light: &RadianceImage,
        ceiling: &RadianceImage,
        svr: &SvrInfo,
    ) -> Result<HdrSequence, Error> {
        if self.frames == 0 {
            return Err(Error::InvalidInput(
                "an HDR sequence needs at least one frame".into(),
            ));
        }
        let dims = required.dimensions();
        if min_light.dimensions() != dims || ceiling.dimensions() != dims {
            return Err(Error::InvalidInput(format!(
                "required radiance is {dims:?} but the display bounds are {:?} and {:?}",
                min_light.dimensions(),
                ceiling.dimensions()
            )));
        }

        let (scale, auto_scaled) = match self.scale {
            Some(scale) => (scale, false),
            None => (self.auto_scale(required, ceiling), true),
        };
        info!(scale, auto_scaled, frames = self.frames, "exposure multiplier");

        let n = self.frames;
        let width = dims.0.max(1);
        let mut buffer = vec![[0.0f32; 3]; dims.0 * dims.1 * n];
        buffer
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, slots)| {
                let (x, y) = (i % width, i / width);
                let (req, lo, ceil) = (
                    required.pixels()[i],
                    min_light.pixels()[i],
                    ceiling.pixels()[i],
                );
                for c in 0..3 {
                    if ceil[c] <= 0.0 {
                        continue;
                    }
                    let mut val = req[c] * scale as f32;
                    for slot in slots.iter_mut() {
                        if val <= 0.0 {
                            break;
                        }
                        if val >= ceil[c] {
                            slot[c] = 1.0;
                            val -= ceil[c];
                        } else {
                            slot[c] =
                                svr.apply_response_svr_subpixel(val + lo[c], x as f64, y as f64, c);
                            val = 0.0;
                        }
                    }
                }
            });

        let mut frames = (0..n)
            .map(|f| {
                let pixels = buffer.iter().skip(f).step_by(n).copied().collect();
                RadianceImage::from_pixels(dims.0, dims.1, pixels)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some((w, h)) = self.upscale {
            if (w, h) != dims {
                debug!(from = ?dims, to = ?(w, h), "upscaling frames");
                frames = frames.iter().map(|f| f.resize(w, h)).collect();
            }
        }

        if self.blur > 0.0 {
            let height = frames.first().map_or(0, |f| f.height());
            let ksize = (self.blur * height as f64 / 2.0) as i64 * 2 + 1;
            debug!(ksize, "blurring frames");
            frames = frames.iter().map(|f| f.blur(ksize as f32)).collect();
        }

        Ok(HdrSequence {
            frames,
            scale,
            auto_scaled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svr::Patch;
    use approx::assert_relative_eq;

    /// Single patch covering `size` pixels with an identity response.
    fn identity_svr(size: usize) -> SvrInfo {
        let response = (0..=100)
            .map(|i| [i as f32 / 100.0; 3])
            .collect();
        let patch = Patch {
            min: [0.0; 3],
            max: [1.0; 3],
            response,
        };
        let s = size as f64;
        SvrInfo::new(vec![patch], (1, 1), s, (s, s), (0.0, 0.0)).unwrap()
    }

    fn bounds(size: usize) -> (RadianceImage, RadianceImage) {
        (
            RadianceImage::new(size, size),
            RadianceImage::filled(size, size, [1.0; 3]),
        )
    }

    #[test]
    fn auto_scale_fills_every_frame() {
        let (lo, ceil) = bounds(1);
        let required = RadianceImage::filled(1, 1, [2.5; 3]);
        let seq = HdrSequencer::new(3)
            .decompose(&required, &lo, &ceil, &identity_svr(1))
            .unwrap();

        assert!(seq.auto_scaled);
        assert_relative_eq!(seq.scale, 1.2, epsilon = 1e-12);
        let values: Vec<f32> = seq.frames.iter().map(|f| f.pixels()[0][0]).collect();
        assert_eq!(values, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn explicit_scale_leaves_remainder_in_last_frame() {
        let (lo, ceil) = bounds(1);
        let required = RadianceImage::filled(1, 1, [2.5; 3]);
        let seq = HdrSequencer::new(3)
            .with_scale(1.0)
            .decompose(&required, &lo, &ceil, &identity_svr(1))
            .unwrap();

        assert!(!seq.auto_scaled);
        assert_eq!(seq.scale, 1.0);
        let values: Vec<f32> = seq.frames.iter().map(|f| f.pixels()[0][2]).collect();
        assert_relative_eq!(values[0], 1.0);
        assert_relative_eq!(values[1], 1.0);
        assert_relative_eq!(values[2], 0.5);
    }

    #[test]
    fn dark_pixels_get_dark_frames() {
        let (lo, ceil) = bounds(2);
        let mut required = RadianceImage::filled(2, 2, [1.0; 3]);
        *required.get_mut(1, 1).unwrap() = [0.0; 3];
        let seq = HdrSequencer::new(4)
            .decompose(&required, &lo, &ceil, &identity_svr(2))
            .unwrap();
        for frame in &seq.frames {
            assert_eq!(frame.get(1, 1), Some(&[0.0; 3]));
        }
    }

    #[test]
    fn nothing_required_keeps_unit_scale() {
        let (lo, ceil) = bounds(2);
        let required = RadianceImage::new(2, 2);
        let sequencer = HdrSequencer::new(2);
        assert_eq!(sequencer.auto_scale(&required, &ceil), 1.0);
        let seq = sequencer
            .decompose(&required, &lo, &ceil, &identity_svr(2))
            .unwrap();
        assert!(seq.frames.iter().all(|f| f.max_value() == 0.0));
    }

    #[test]
    fn zero_ceiling_is_skipped() {
        let lo = RadianceImage::new(1, 1);
        let ceil = RadianceImage::filled(1, 1, [1.0, 0.0, 1.0]);
        let required = RadianceImage::filled(1, 1, [0.5, 7.0, 0.5]);
        let sequencer = HdrSequencer::new(1);
        assert_relative_eq!(sequencer.auto_scale(&required, &ceil), 2.0);
        let seq = sequencer
            .decompose(&required, &lo, &ceil, &identity_svr(1))
            .unwrap();
        assert_eq!(seq.frames[0].pixels()[0], [1.0, 0.0, 1.0]);
    }

    #[test]
    fn upscales_to_panel() {
        let (lo, ceil) = bounds(2);
        let required = RadianceImage::filled(2, 2, [0.5; 3]);
        let seq = HdrSequencer::new(1)
            .with_upscale(4, 4)
            .decompose(&required, &lo, &ceil, &identity_svr(2))
            .unwrap();
        assert_eq!(seq.frames[0].dimensions(), (4, 4));
    }

    #[test]
    fn rejects_empty_budget_and_mismatched_bounds() {
        let (lo, ceil) = bounds(2);
        let required = RadianceImage::new(2, 2);
        assert!(HdrSequencer::new(0)
            .decompose(&required, &lo, &ceil, &identity_svr(2))
            .is_err());
        assert!(HdrSequencer::new(1)
            .decompose(&RadianceImage::new(3, 2), &lo, &ceil, &identity_svr(2))
            .is_err());
    }
}
