//! Cube map storage.
//!
//! The six faces are kept side by side in one wide image:
//!
//! ```text
//!     0    1    2    3    4    5
//!  +------------------------------+
//!  |  L | Ba |  R |  F |  T |  Bo |
//!  | -X | +Y | +X | -Y | +Z | -Z  | forward
//!  |  Y |  X | -Y | -X |  X |  X  | right
//!  | -Z | -Z | -Z | -Z |  Y | -Y  | down
//!  +------------------------------+
//! ```

use crate::{error::Error, image::RadianceImage};
use nalgebra::{Point2, Vector3};
use rayon::prelude::*;
use std::f64::consts::PI;

/// One face of the cube.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Face {
    Left,
    Back,
    Right,
    Front,
    Top,
    Bottom,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::Left,
        Face::Back,
        Face::Right,
        Face::Front,
        Face::Top,
        Face::Bottom,
    ];

    /// Position of the face in the wide image.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Axis the face looks along, seen from the cube center.
    pub fn forward(self) -> Vector3<f64> {
        match self {
            Face::Left => -Vector3::x(),
            Face::Back => Vector3::y(),
            Face::Right => Vector3::x(),
            Face::Front => -Vector3::y(),
            Face::Top => Vector3::z(),
            Face::Bottom => -Vector3::z(),
        }
    }

    /// Direction of increasing pixel column.
    pub fn right(self) -> Vector3<f64> {
        match self {
            Face::Left => Vector3::y(),
            Face::Back => Vector3::x(),
            Face::Right => -Vector3::y(),
            Face::Front => -Vector3::x(),
            Face::Top | Face::Bottom => Vector3::x(),
        }
    }

    /// Direction of increasing pixel row.
    pub fn down(self) -> Vector3<f64> {
        match self {
            Face::Left | Face::Back | Face::Right | Face::Front => -Vector3::z(),
            Face::Top => Vector3::y(),
            Face::Bottom => -Vector3::y(),
        }
    }

    /// The face a direction from the cube center passes through.
    ///
    /// The dominant absolute coordinate picks the axis and its sign picks the
    /// side. Ties keep the earlier axis in x, y, z order.
    pub fn for_direction(dir: &Vector3<f64>) -> Self {
        const LUT: [Face; 6] = [
            Face::Right,
            Face::Back,
            Face::Top,
            Face::Left,
            Face::Front,
            Face::Bottom,
        ];

        let mut axis = 0;
        if dir[1].abs() > dir[axis].abs() {
            axis = 1;
        }
        if dir[2].abs() > dir[axis].abs() {
            axis = 2;
        }
        if dir[axis] > 0.0 { LUT[axis] } else { LUT[axis + 3] }
    }

    /// Continuous pixel coordinates of `point` projected onto the face plane.
    ///
    /// Pixel centers sit on integer coordinates, so the face spans
    /// `[-0.5, size - 0.5]` in both axes. Returns `None` for points on or behind
    /// the plane through the cube center parallel to the face.
    pub fn project(self, point: &Vector3<f64>, size: usize) -> Option<Point2<f64>> {
        let depth = point.dot(&self.forward());
        if depth <= f64::EPSILON {
            return None;
        }
        let n = size as f64;
        let x = (point.dot(&self.right()) / depth + 1.0) / 2.0 * n - 0.5;
        let y = (point.dot(&self.down()) / depth + 1.0) / 2.0 * n - 0.5;
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        Some(Point2::new(x, y))
    }

    /// Direction through the continuous face position `(x, y)` on a unit cube.
    pub fn direction(self, x: f64, y: f64, size: usize) -> Vector3<f64> {
        let delta = 2.0 / size as f64;
        let half = (size as f64 - 1.0) / 2.0;
        self.forward() + self.down() * delta * (y - half) + self.right() * delta * (x - half)
    }
}

/// Radius, polar angle from +z and azimuth from +x.
pub fn cart_to_spherical(v: &Vector3<f64>) -> Vector3<f64> {
    let r = v.norm();
    let phi = if r > 0.0 { (v.z / r).acos() } else { 0.0 };
    let theta = v.y.atan2(v.x);
    Vector3::new(r, phi, theta)
}

/// Six square faces of RGB radiance stored as one `6 * size` by `size` image.
#[derive(Clone, Debug, PartialEq)]
pub struct CubeMap {
    size: usize,
    image: RadianceImage,
}

impl CubeMap {
    /// A black cube map with faces of `size` pixels.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            image: RadianceImage::new(6 * size, size),
        }
    }

    /// True if an image with these dimensions is already a cube map strip.
    pub fn is_strip(width: usize, height: usize) -> bool {
        width > 5 * height
    }

    /// Wrap an existing strip image.
    pub fn from_strip(image: RadianceImage) -> Result<Self, Error> {
        let size = image.height();
        if size == 0 || image.width() != 6 * size {
            return Err(Error::InvalidInput(format!(
                "cube map strip must be 6 faces wide but is {}x{}",
                image.width(),
                image.height()
            )));
        }
        Ok(Self { size, image })
    }

    /// Resample an equirectangular (latitude/longitude) map onto a cube.
    ///
    /// Each face pixel averages a `supersampling` x `supersampling` grid of
    /// directions spread over the pixel footprint. The grid is centred on the
    /// pixel, so `supersampling` must be odd. The source is sampled bilinearly,
    /// wrapping around in longitude.
    pub fn from_equirectangular(
        spherical: &RadianceImage,
        size: usize,
        supersampling: usize,
    ) -> Result<Self, Error> {
        if spherical.width() == 0 || spherical.height() == 0 || size == 0 {
            return Err(Error::InvalidInput(
                "cannot build a cube map from an empty image".into(),
            ));
        }

        if supersampling % 2 == 0 {
            return Err(Error::InvalidInput(format!(
                "supersampling grid must be odd but is {supersampling}"
            )));
        }

        let grid = supersampling;
        let reach = (grid as i64 - 1) / 2;
        let step = if grid > 1 { 1.0 / (grid - 1) as f64 } else { 0.0 };
        let offsets: Vec<f64> = (-reach..=reach).map(|s| s as f64 * step).collect();
        let norm = 1.0 / (offsets.len() * offsets.len()) as f32;
        let width = 6 * size;

        let pixels: Vec<[f32; 3]> = (0..width * size)
            .into_par_iter()
            .map(|i| {
                let (gx, y) = (i % width, i / width);
                let face = Face::ALL[gx / size];
                let x = gx % size;

                let mut acc = [0.0f32; 3];
                for sy in &offsets {
                    for sx in &offsets {
                        let dir = face.direction(x as f64 + sx, y as f64 + sy, size);
                        let v = sample_equirectangular(spherical, &dir);
                        for c in 0..3 {
                            acc[c] += v[c];
                        }
                    }
                }
                acc.map(|v| v * norm)
            })
            .collect();

        Ok(Self {
            size,
            image: RadianceImage::from_pixels(width, size, pixels)?,
        })
    }

    /// Face edge length in pixels.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn image(&self) -> &RadianceImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RadianceImage {
        &mut self.image
    }

    pub fn into_image(self) -> RadianceImage {
        self.image
    }

    /// Copy of one face.
    pub fn face(&self, face: Face) -> RadianceImage {
        self.image
            .crop(face.index() * self.size, 0, self.size, self.size)
            .unwrap_or_else(|_| RadianceImage::new(self.size, self.size))
    }

    /// Add `src` into the pixels of `face`.
    pub fn add_to_face(&mut self, face: Face, src: &RadianceImage) -> Result<(), Error> {
        if src.dimensions() != (self.size, self.size) {
            return Err(Error::InvalidInput(format!(
                "face image must be {0}x{0} but is {1:?}",
                self.size,
                src.dimensions()
            )));
        }
        let width = self.image.width();
        let offset = face.index() * self.size;
        let dst = self.image.pixels_mut();
        for (row, line) in src.pixels().chunks(self.size).enumerate() {
            let start = row * width + offset;
            for (d, s) in dst[start..start + self.size].iter_mut().zip(line) {
                for c in 0..3 {
                    d[c] += s[c];
                }
            }
        }
        Ok(())
    }
}

fn sample_equirectangular(spherical: &RadianceImage, dir: &Vector3<f64>) -> [f32; 3] {
    let (w, h) = (spherical.width() as f64, spherical.height() as f64);
    let s = cart_to_spherical(dir);
    let u = (1.0 - (s[2] / PI + 1.0) / 2.0) * w - 0.5;
    let v = (s[1] / PI * h - 0.5).clamp(0.0, h - 1.0);

    let u0 = u.floor();
    let v0 = v.floor();
    let fu = (u - u0) as f32;
    let fv = (v - v0) as f32;
    let wrap = |x: f64| (x as i64).rem_euclid(spherical.width() as i64) as usize;
    let clamp = |y: f64| (y as usize).min(spherical.height() - 1);
    let (x0, x1) = (wrap(u0), wrap(u0 + 1.0));
    let (y0, y1) = (clamp(v0), clamp(v0 + 1.0));

    let px = |x, y| spherical.get(x, y).copied().unwrap_or([0.0; 3]);
    let (a, b, c, d) = (px(x0, y0), px(x1, y0), px(x0, y1), px(x1, y1));
    [0, 1, 2].map(|k| {
        (a[k] * (1.0 - fu) + b[k] * fu) * (1.0 - fv) + (c[k] * (1.0 - fu) + d[k] * fu) * fv
    })
}
