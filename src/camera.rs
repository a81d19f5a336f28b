//! Pinhole model of the tracking camera with radial-tangential distortion.

use crate::error::Error;
use image::{Rgb, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Intrinsics of the tracking camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length in pixels (x-axis).
    pub fx: f64,
    /// Focal length in pixels (y-axis).
    pub fy: f64,
    /// Principal point x (pixels).
    pub cx: f64,
    /// Principal point y (pixels).
    pub cy: f64,
    /// Image resolution [width, height].
    pub resolution: [usize; 2],
    /// Distortion coefficients [k1, k2, p1, p2]. Missing values are zero.
    #[serde(default)]
    pub distortion: Vec<f64>,
}

impl CameraIntrinsics {
    /// Construct from explicit parameters (no distortion).
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: usize, height: usize) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            resolution: [width, height],
            distortion: Vec::new(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let intrinsics: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(Error::Tracking(format!(
                "focal lengths must be positive but are {} and {}",
                intrinsics.fx, intrinsics.fy
            )));
        }
        Ok(intrinsics)
    }

    /// Pixel to normalized image coordinates, `K^-1 [u, v, 1]`.
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    pub fn denormalize(&self, x_n: f64, y_n: f64) -> (f64, f64) {
        (x_n * self.fx + self.cx, y_n * self.fy + self.cy)
    }

    fn coefficients(&self) -> [f64; 4] {
        [0, 1, 2, 3].map(|i| self.distortion.get(i).copied().unwrap_or(0.0))
    }

    /// Apply the lens distortion to normalized coordinates.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2] = self.coefficients();
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Undistort a pixel by fixed point iteration on the distortion model.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if self.distortion.iter().all(|&k| k == 0.0) {
            return (u, v);
        }
        let [k1, k2, p1, p2] = self.coefficients();
        let (x0, y0) = self.normalize(u, v);
        let (mut x, mut y) = (x0, y0);
        for _ in 0..20 {
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (x0 - dx) / radial;
            y = (y0 - dy) / radial;
        }
        self.denormalize(x, y)
    }
}

/// Precomputed source position for every pixel of the undistorted image.
#[derive(Clone, Debug, PartialEq)]
pub struct UndistortMap {
    width: usize,
    height: usize,
    map: Vec<(f32, f32)>,
}

impl UndistortMap {
    pub fn new(intrinsics: &CameraIntrinsics) -> Self {
        let [width, height] = intrinsics.resolution;
        let map = (0..width * height)
            .into_par_iter()
            .map(|i| {
                let (x, y) = intrinsics.normalize((i % width) as f64, (i / width) as f64);
                let (xd, yd) = intrinsics.distort(x, y);
                let (u, v) = intrinsics.denormalize(xd, yd);
                (u as f32, v as f32)
            })
            .collect();
        Self { width, height, map }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Resample `frame` through the map. Pixels mapping outside the frame are black.
    pub fn remap(&self, frame: &RgbImage) -> RgbImage {
        let (fw, fh) = (frame.width() as i64, frame.height() as i64);
        let fetch = |x: i64, y: i64| -> [f32; 3] {
            if x < 0 || y < 0 || x >= fw || y >= fh {
                return [0.0; 3];
            }
            frame.get_pixel(x as u32, y as u32).0.map(f32::from)
        };

        let raw: Vec<u8> = self
            .map
            .par_iter()
            .flat_map_iter(|&(u, v)| {
                let (x0, y0) = (u.floor(), v.floor());
                let (fx, fy) = (u - x0, v - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let (a, b, c, d) = (
                    fetch(x0, y0),
                    fetch(x0 + 1, y0),
                    fetch(x0, y0 + 1),
                    fetch(x0 + 1, y0 + 1),
                );
                [0, 1, 2].map(|k| {
                    let top = a[k] * (1.0 - fx) + b[k] * fx;
                    let bottom = c[k] * (1.0 - fx) + d[k] * fx;
                    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
                })
            })
            .collect();

        RgbImage::from_raw(self.width as u32, self.height as u32, raw)
            .unwrap_or_else(|| RgbImage::from_pixel(self.width as u32, self.height as u32, Rgb([0; 3])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalize_denormalize() {
        let cam = CameraIntrinsics::new(458.654, 457.296, 367.215, 248.375, 752, 480);
        let (xn, yn) = cam.normalize(367.215, 248.375);
        assert_relative_eq!(xn, 0.0);
        assert_relative_eq!(yn, 0.0);
        let (u, v) = cam.denormalize(cam.normalize(123.4, 321.6).0, cam.normalize(123.4, 321.6).1);
        assert_relative_eq!(u, 123.4, epsilon = 1e-10);
        assert_relative_eq!(v, 321.6, epsilon = 1e-10);
    }

    #[test]
    fn undistort_inverts_distort() {
        let mut cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        cam.distortion = vec![-0.28, 0.07, 0.0002, 0.00002];
        let (xd, yd) = cam.distort(0.2, -0.1);
        let (u, v) = cam.denormalize(xd, yd);
        let (uu, vu) = cam.undistort_point(u, v);
        assert_relative_eq!(uu, 420.0, epsilon = 1e-6);
        assert_relative_eq!(vu, 190.0, epsilon = 1e-6);
    }

    #[test]
    fn identity_map_keeps_frame() {
        let cam = CameraIntrinsics::new(10.0, 10.0, 2.0, 2.0, 4, 4);
        let map = UndistortMap::new(&cam);
        let frame = RgbImage::from_fn(4, 4, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 7]));
        assert_eq!(map.remap(&frame), frame);
    }

    #[test]
    fn loads_json_without_distortion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.json");
        fs::write(
            &path,
            r#"{ "fx": 800.0, "fy": 810.0, "cx": 320.0, "cy": 240.0, "resolution": [640, 480] }"#,
        )
        .unwrap();
        let cam = CameraIntrinsics::load(&path).unwrap();
        assert_eq!(cam.resolution, [640, 480]);
        assert!(cam.distortion.is_empty());
    }
}
