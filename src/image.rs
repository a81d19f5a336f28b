//! Floating point RGB images and the pixel operations the projector runs on them.

use crate::{error::Error, homography::Homography};
use image::{Rgb32FImage, RgbImage, imageops::FilterType};
use nalgebra::{Matrix3, Point2, Vector3};
use rayon::prelude::*;
use std::path::Path;

/// A floating point RGB radiance image.
///
/// Pixels are stored row by row. Values are linear radiance and are not clamped,
/// so an image can hold anything from an HDR environment map to a normalized
/// display frame in `[0, 1]`.
///
/// ```text
/// +--------+--------+-----+--------+
/// |      0 |      1 | ... |    w-1 |
/// +--------+--------+-----+--------+
/// |      w |    w+1 | ... |   2w-1 |
/// +--------+--------+-----+--------+
/// |    ... |
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RadianceImage {
    dims: (usize, usize),
    pixels: Vec<[f32; 3]>,
}

impl RadianceImage {
    /// Create a black image.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, [0.0; 3])
    }

    pub fn filled(width: usize, height: usize, value: [f32; 3]) -> Self {
        Self {
            dims: (width, height),
            pixels: vec![value; width * height],
        }
    }

    pub fn from_pixels(width: usize, height: usize, pixels: Vec<[f32; 3]>) -> Result<Self, Error> {
        if pixels.len() != width * height {
            return Err(Error::InvalidInput(format!(
                "expected {} pixels for a {width}x{height} image but got {}",
                width * height,
                pixels.len()
            )));
        }

        Ok(Self {
            dims: (width, height),
            pixels,
        })
    }

    pub fn width(&self) -> usize {
        self.dims.0
    }

    pub fn height(&self) -> usize {
        self.dims.1
    }

    pub fn dimensions(&self) -> (usize, usize) {
        self.dims
    }

    pub fn pixels(&self) -> &[[f32; 3]] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [[f32; 3]] {
        &mut self.pixels
    }

    /// Returns the pixel at `(x, y)` if it lies within the image.
    pub fn get(&self, x: usize, y: usize) -> Option<&[f32; 3]> {
        if x >= self.dims.0 || y >= self.dims.1 {
            return None;
        }
        self.pixels.get(y * self.dims.0 + x)
    }

    pub fn get_mut(&mut self, x: usize, y: usize) -> Option<&mut [f32; 3]> {
        if x >= self.dims.0 || y >= self.dims.1 {
            return None;
        }
        self.pixels.get_mut(y * self.dims.0 + x)
    }

    pub fn fill(&mut self, value: [f32; 3]) {
        self.pixels.iter_mut().for_each(|px| *px = value);
    }

    /// Bilinearly sample the image at a continuous position.
    ///
    /// Pixel centers sit on integer coordinates. Neighbours outside the image
    /// contribute zero, so samples fade out over the half pixel beyond each edge.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> [f32; 3] {
        let (w, h) = (self.dims.0 as f64, self.dims.1 as f64);
        if !x.is_finite() || !y.is_finite() || x <= -1.0 || y <= -1.0 || x >= w || y >= h {
            return [0.0; 3];
        }

        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let mut out = [0.0f32; 3];
        for (dx, dy, weight) in [
            (0, 0, (1.0 - fx) * (1.0 - fy)),
            (1, 0, fx * (1.0 - fy)),
            (0, 1, (1.0 - fx) * fy),
            (1, 1, fx * fy),
        ] {
            if weight == 0.0 {
                continue;
            }
            let (sx, sy) = (x0 + dx, y0 + dy);
            if sx < 0 || sy < 0 {
                continue;
            }
            if let Some(px) = self.get(sx as usize, sy as usize) {
                for c in 0..3 {
                    out[c] += weight * px[c];
                }
            }
        }
        out
    }

    /// Copy a rectangular region into a new image.
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Result<Self, Error> {
        if x + width > self.dims.0 || y + height > self.dims.1 {
            return Err(Error::InvalidInput(format!(
                "crop {width}x{height}+{x}+{y} exceeds image of {}x{}",
                self.dims.0, self.dims.1
            )));
        }

        let pixels = (y..y + height)
            .flat_map(|row| {
                let start = row * self.dims.0 + x;
                self.pixels[start..start + width].iter().copied()
            })
            .collect();

        Ok(Self {
            dims: (width, height),
            pixels,
        })
    }

    /// Overwrite the region starting at `(x, y)` with `src`, clipped to this image.
    pub fn paste(&mut self, src: &RadianceImage, x: i64, y: i64) {
        for sy in 0..src.height() {
            let ty = y + sy as i64;
            if ty < 0 || ty >= self.dims.1 as i64 {
                continue;
            }
            for sx in 0..src.width() {
                let tx = x + sx as i64;
                if tx < 0 || tx >= self.dims.0 as i64 {
                    continue;
                }
                self.pixels[ty as usize * self.dims.0 + tx as usize] =
                    src.pixels[sy * src.width() + sx];
            }
        }
    }

    /// Largest channel value in the image.
    pub fn max_value(&self) -> f32 {
        self.pixels
            .iter()
            .flat_map(|px| px.iter().copied())
            .fold(f32::NEG_INFINITY, f32::max)
    }

    /// Mean over all pixels and channels.
    pub fn mean(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .pixels
            .iter()
            .flat_map(|px| px.iter())
            .map(|&v| v as f64)
            .sum();
        (sum / (self.pixels.len() * 3) as f64) as f32
    }

    /// True if every channel of every pixel is at most `epsilon`.
    pub fn is_below(&self, epsilon: f32) -> bool {
        self.pixels
            .par_iter()
            .all(|px| px.iter().all(|&v| v <= epsilon))
    }

    /// Apply a 3x3 color matrix to every pixel.
    pub fn transform_colors(&mut self, matrix: &Matrix3<f32>) {
        self.pixels.par_iter_mut().for_each(|px| {
            let out = matrix * Vector3::from(*px);
            *px = [out.x, out.y, out.z];
        });
    }

    /// Resample to a new size with a Catmull-Rom filter.
    pub fn resize(&self, width: usize, height: usize) -> Self {
        if (width, height) == self.dims {
            return self.clone();
        }
        let resized = image::imageops::resize(
            &self.to_rgb32f(),
            width as u32,
            height as u32,
            FilterType::CatmullRom,
        );
        Self::from_rgb32f(&resized)
    }

    /// Gaussian blur with standard deviation `sigma` in pixels.
    pub fn blur(&self, sigma: f32) -> Self {
        if sigma <= 0.0 {
            return self.clone();
        }
        Self::from_rgb32f(&image::imageops::blur(&self.to_rgb32f(), sigma))
    }

    pub fn to_rgb32f(&self) -> Rgb32FImage {
        let raw: Vec<f32> = self.pixels.iter().flat_map(|px| px.iter().copied()).collect();
        Rgb32FImage::from_raw(self.dims.0 as u32, self.dims.1 as u32, raw)
            .unwrap_or_else(|| Rgb32FImage::new(self.dims.0 as u32, self.dims.1 as u32))
    }

    pub fn from_rgb32f(img: &Rgb32FImage) -> Self {
        let pixels = img.pixels().map(|px| px.0).collect();
        Self {
            dims: (img.width() as usize, img.height() as usize),
            pixels,
        }
    }

    /// Quantize to 8 bits per channel, clamping to `[0, 1]`.
    pub fn to_rgb8(&self) -> RgbImage {
        let raw: Vec<u8> = self
            .pixels
            .iter()
            .flat_map(|px| px.iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect();
        RgbImage::from_raw(self.dims.0 as u32, self.dims.1 as u32, raw)
            .unwrap_or_else(|| RgbImage::new(self.dims.0 as u32, self.dims.1 as u32))
    }

    /// Load any format the `image` crate can decode, converted to linear float RGB.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let img = image::open(path)?.into_rgb32f();
        Ok(Self::from_rgb32f(&img))
    }

    /// Save as OpenEXR, keeping the full float range.
    pub fn save_exr<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        self.to_rgb32f()
            .save_with_format(path, image::ImageFormat::OpenExr)?;
        Ok(())
    }

    /// Save as an 8 bit image in the format implied by the file extension.
    pub fn save_ldr<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        self.to_rgb8().save(path)?;
        Ok(())
    }
}

fn check_dims(dst: &RadianceImage, src: &RadianceImage) -> Result<(), Error> {
    if dst.dims != src.dims {
        return Err(Error::InvalidInput(format!(
            "image dimensions differ: {:?} vs {:?}",
            dst.dims, src.dims
        )));
    }
    Ok(())
}

/// Per-pixel operations the light stage needs on radiance images.
///
/// The projection and sequencing code is written once against this trait.
/// [`SequentialBackend`] is the plain reference implementation and
/// [`ParallelBackend`] spreads the same work over the rayon thread pool.
pub trait ImageBackend: Send + Sync {
    /// Combine `src` into `dst` pixel by pixel.
    fn zip_with(
        &self,
        dst: &mut RadianceImage,
        src: &RadianceImage,
        op: &(dyn Fn(&mut [f32; 3], &[f32; 3]) + Sync),
    ) -> Result<(), Error>;

    /// Apply `op` to every pixel of `dst` together with its `(x, y)` position.
    fn for_each_pixel(
        &self,
        dst: &mut RadianceImage,
        op: &(dyn Fn(usize, usize, &mut [f32; 3]) + Sync),
    );

    /// Projectively resample `src` into a new `width` x `height` image.
    ///
    /// `map` takes destination pixel coordinates to source pixel coordinates.
    /// Positions that fall outside `src`, or that `map` sends through infinity,
    /// are left black.
    fn warp(
        &self,
        src: &RadianceImage,
        map: &Homography,
        width: usize,
        height: usize,
    ) -> RadianceImage {
        let mut out = RadianceImage::new(width, height);
        self.for_each_pixel(&mut out, &|x, y, px| {
            if let Some(p) = map.apply(Point2::new(x as f64, y as f64)) {
                *px = src.sample_bilinear(p.x, p.y);
            }
        });
        out
    }

    fn add(&self, dst: &mut RadianceImage, src: &RadianceImage) -> Result<(), Error> {
        self.zip_with(dst, src, &|d, s| {
            for c in 0..3 {
                d[c] += s[c];
            }
        })
    }

    fn subtract(&self, dst: &mut RadianceImage, src: &RadianceImage) -> Result<(), Error> {
        self.zip_with(dst, src, &|d, s| {
            for c in 0..3 {
                d[c] -= s[c];
            }
        })
    }

    fn multiply(&self, dst: &mut RadianceImage, src: &RadianceImage) -> Result<(), Error> {
        self.zip_with(dst, src, &|d, s| {
            for c in 0..3 {
                d[c] *= s[c];
            }
        })
    }

    fn scale(&self, dst: &mut RadianceImage, factor: f32) {
        self.for_each_pixel(dst, &|_, _, px| {
            for v in px.iter_mut() {
                *v *= factor;
            }
        });
    }

    /// Per channel minimum with a constant.
    fn min_scalar(&self, dst: &mut RadianceImage, value: f32) {
        self.for_each_pixel(dst, &|_, _, px| {
            for v in px.iter_mut() {
                *v = v.min(value);
            }
        });
    }

    fn clamp(&self, dst: &mut RadianceImage, lower: f32, upper: f32) {
        self.for_each_pixel(dst, &|_, _, px| {
            for v in px.iter_mut() {
                *v = v.clamp(lower, upper);
            }
        });
    }
}

/// Single threaded reference backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialBackend;

impl ImageBackend for SequentialBackend {
    fn zip_with(
        &self,
        dst: &mut RadianceImage,
        src: &RadianceImage,
        op: &(dyn Fn(&mut [f32; 3], &[f32; 3]) + Sync),
    ) -> Result<(), Error> {
        check_dims(dst, src)?;
        dst.pixels
            .iter_mut()
            .zip(src.pixels.iter())
            .for_each(|(d, s)| op(d, s));
        Ok(())
    }

    fn for_each_pixel(
        &self,
        dst: &mut RadianceImage,
        op: &(dyn Fn(usize, usize, &mut [f32; 3]) + Sync),
    ) {
        let width = dst.width().max(1);
        dst.pixels
            .iter_mut()
            .enumerate()
            .for_each(|(i, px)| op(i % width, i / width, px));
    }
}

/// Data parallel backend running on the rayon thread pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelBackend;

impl ImageBackend for ParallelBackend {
    fn zip_with(
        &self,
        dst: &mut RadianceImage,
        src: &RadianceImage,
        op: &(dyn Fn(&mut [f32; 3], &[f32; 3]) + Sync),
    ) -> Result<(), Error> {
        check_dims(dst, src)?;
        dst.pixels
            .par_iter_mut()
            .zip(src.pixels.par_iter())
            .for_each(|(d, s)| op(d, s));
        Ok(())
    }

    fn for_each_pixel(
        &self,
        dst: &mut RadianceImage,
        op: &(dyn Fn(usize, usize, &mut [f32; 3]) + Sync),
    ) {
        let width = dst.width().max(1);
        dst.pixels
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, px)| op(i % width, i / width, px));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gradient(width: usize, height: usize) -> RadianceImage {
        let pixels = (0..width * height)
            .map(|i| {
                let v = i as f32;
                [v, v * 2.0, v * 3.0]
            })
            .collect();
        RadianceImage::from_pixels(width, height, pixels).unwrap()
    }

    #[test]
    fn rejects_wrong_pixel_count() {
        assert!(RadianceImage::from_pixels(2, 2, vec![[0.0; 3]; 3]).is_err());
    }

    #[test]
    fn bilinear_hits_pixel_centers() {
        let img = gradient(4, 3);
        assert_eq!(img.sample_bilinear(2.0, 1.0), *img.get(2, 1).unwrap());
        let mid = img.sample_bilinear(2.5, 1.0);
        assert_relative_eq!(mid[0], 6.5);
    }

    #[test]
    fn bilinear_fades_outside() {
        let img = RadianceImage::filled(2, 2, [1.0; 3]);
        assert_relative_eq!(img.sample_bilinear(-0.5, 0.0)[0], 0.5);
        assert_eq!(img.sample_bilinear(-1.0, 0.0), [0.0; 3]);
        assert_eq!(img.sample_bilinear(0.0, 2.0), [0.0; 3]);
    }

    #[test]
    fn backends_agree() {
        let a = gradient(5, 4);
        let b = RadianceImage::filled(5, 4, [0.5, 2.0, 1.0]);

        let mut seq = a.clone();
        SequentialBackend.multiply(&mut seq, &b).unwrap();
        SequentialBackend.subtract(&mut seq, &b).unwrap();
        SequentialBackend.add(&mut seq, &a).unwrap();

        let mut par = a.clone();
        ParallelBackend.multiply(&mut par, &b).unwrap();
        ParallelBackend.subtract(&mut par, &b).unwrap();
        ParallelBackend.add(&mut par, &a).unwrap();

        assert_eq!(seq, par);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let mut a = RadianceImage::new(2, 2);
        let b = RadianceImage::new(3, 2);
        assert!(ParallelBackend.add(&mut a, &b).is_err());
        assert!(SequentialBackend.add(&mut a, &b).is_err());
    }

    #[test]
    fn identity_warp_copies() {
        let img = gradient(6, 4);
        let identity = Homography::identity();
        let seq = SequentialBackend.warp(&img, &identity, 6, 4);
        let par = ParallelBackend.warp(&img, &identity, 6, 4);
        assert_eq!(seq, img);
        assert_eq!(par, img);
    }

    #[test]
    fn paste_is_clipped() {
        let mut dst = RadianceImage::new(3, 3);
        let src = RadianceImage::filled(2, 2, [1.0; 3]);
        dst.paste(&src, 2, -1);
        assert_eq!(dst.get(2, 0), Some(&[1.0; 3]));
        assert_eq!(dst.get(1, 0), Some(&[0.0; 3]));
        assert_eq!(dst.get(2, 1), Some(&[0.0; 3]));
    }

    #[test]
    fn crop_takes_region() {
        let img = gradient(4, 4);
        let c = img.crop(1, 2, 2, 2).unwrap();
        assert_eq!(c.get(0, 0), img.get(1, 2));
        assert_eq!(c.get(1, 1), img.get(2, 3));
        assert!(img.crop(3, 3, 2, 2).is_err());
    }

    #[test]
    fn rgb32f_conversion_keeps_values() {
        let img = gradient(3, 2);
        assert_eq!(RadianceImage::from_rgb32f(&img.to_rgb32f()), img);
    }

    #[test]
    fn color_transform_swaps_channels() {
        let mut img = RadianceImage::filled(1, 1, [1.0, 2.0, 3.0]);
        let swap = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
        img.transform_colors(&swap);
        assert_eq!(img.get(0, 0), Some(&[3.0, 2.0, 1.0]));
    }
}
