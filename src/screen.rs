use crate::{error::Error, image::RadianceImage};
use nalgebra::{Matrix3, Point2, Vector3};
use uom::si::{
    angle::degree,
    f64::{Angle, Length},
    length::millimeter,
};

/// Placement of the active screen area in stage coordinates (millimeters).
///
/// `down` and `right` are unit vectors along the pixel rows and columns.
/// The screen emits light along `down x right`, toward the stage origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenPose {
    pub center: Vector3<f64>,
    pub down: Vector3<f64>,
    pub right: Vector3<f64>,
}

impl ScreenPose {
    pub fn new(center: Vector3<f64>, down: Vector3<f64>, right: Vector3<f64>) -> Self {
        Self {
            center,
            down,
            right,
        }
    }

    /// Screen normal, pointing out of the emitting side.
    pub fn normal(&self) -> Vector3<f64> {
        self.down.cross(&self.right)
    }

    /// Distance of the screen center from the stage origin.
    pub fn distance(&self) -> Length {
        Length::new::<millimeter>(self.center.norm())
    }

    /// How far the screen center moved relative to `other`.
    pub fn drift(&self, other: &ScreenPose) -> Length {
        Length::new::<millimeter>((self.center - other.center).norm())
    }

    /// Angle between the screen normal and the ray from the screen center to the origin.
    ///
    /// This bounds the incidence angle of the light reaching an object at the
    /// stage origin as long as the screen is small compared to its distance.
    pub fn max_angle(&self) -> Angle {
        let normal = self.normal();
        let cos = normal.dot(&-self.center) / (self.center.norm() * normal.norm());
        Angle::new::<degree>(cos.clamp(-1.0, 1.0).acos().to_degrees())
    }
}

/// Pixel grid and physical size of the active (border free) screen area.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenGeometry {
    pixels: (usize, usize),
    size_mm: (f64, f64),
}

impl ScreenGeometry {
    pub fn new(pixels: (usize, usize), size_mm: (f64, f64)) -> Result<Self, Error> {
        if pixels.0 == 0 || pixels.1 == 0 {
            return Err(Error::InvalidInput(format!(
                "screen must have at least one pixel but is {}x{}",
                pixels.0, pixels.1
            )));
        }
        if !(size_mm.0 > 0.0 && size_mm.1 > 0.0) {
            return Err(Error::InvalidInput(format!(
                "screen must have a positive size but is {}x{} mm",
                size_mm.0, size_mm.1
            )));
        }
        Ok(Self { pixels, size_mm })
    }

    pub fn pixels(&self) -> (usize, usize) {
        self.pixels
    }

    pub fn width(&self) -> usize {
        self.pixels.0
    }

    pub fn height(&self) -> usize {
        self.pixels.1
    }

    pub fn size_mm(&self) -> (f64, f64) {
        self.size_mm
    }

    /// Millimeters per pixel along x and y.
    pub fn pitch(&self) -> (f64, f64) {
        (
            self.size_mm.0 / self.pixels.0 as f64,
            self.size_mm.1 / self.pixels.1 as f64,
        )
    }

    /// World position of the (continuous) pixel center `(x, y)`.
    pub fn pixel_position(&self, pose: &ScreenPose, x: f64, y: f64) -> Vector3<f64> {
        let (dx, dy) = self.pitch();
        pose.center
            + pose.down * ((y + 0.5) * dy - self.size_mm.1 / 2.0)
            + pose.right * ((x + 0.5) * dx - self.size_mm.0 / 2.0)
    }

    /// Centers of the four corner pixels: top left, top right, bottom left, bottom right.
    pub fn corner_pixels(&self) -> [Point2<f64>; 4] {
        let (w, h) = ((self.pixels.0 - 1) as f64, (self.pixels.1 - 1) as f64);
        [
            Point2::new(0.0, 0.0),
            Point2::new(w, 0.0),
            Point2::new(0.0, h),
            Point2::new(w, h),
        ]
    }

    /// World positions matching [`ScreenGeometry::corner_pixels`].
    pub fn corners(&self, pose: &ScreenPose) -> [Vector3<f64>; 4] {
        self.corner_pixels()
            .map(|p| self.pixel_position(pose, p.x, p.y))
    }

    /// Every pixel on the outer rows and columns, each listed once.
    pub fn edge_pixels(&self) -> Vec<(usize, usize)> {
        let (w, h) = self.pixels;
        let mut edge: Vec<(usize, usize)> = (0..w).map(|x| (x, 0)).collect();
        if h > 1 {
            edge.extend((0..w).map(|x| (x, h - 1)));
        }
        for y in 1..h.saturating_sub(1) {
            edge.push((0, y));
            if w > 1 {
                edge.push((w - 1, y));
            }
        }
        edge
    }

    /// Alpha mask fading out the outer `ramp` rows and columns linearly.
    ///
    /// Row `i` from the top or bottom edge is scaled by `(i + 1) / (ramp + 1)`,
    /// and the same for columns. The factors multiply in the corners.
    pub fn border_ramp_mask(&self, ramp: (usize, usize)) -> RadianceImage {
        let (w, h) = self.pixels;
        let mut mask = RadianceImage::filled(w, h, [1.0; 3]);

        for y in 0..ramp.1.min(h) {
            let alpha = (y + 1) as f32 / (ramp.1 + 1) as f32;
            for x in 0..w {
                for row in [y, h - 1 - y] {
                    if let Some(px) = mask.get_mut(x, row) {
                        px.iter_mut().for_each(|v| *v *= alpha);
                    }
                }
            }
        }
        for x in 0..ramp.0.min(w) {
            let alpha = (x + 1) as f32 / (ramp.0 + 1) as f32;
            for y in 0..h {
                for col in [x, w - 1 - x] {
                    if let Some(px) = mask.get_mut(col, y) {
                        px.iter_mut().for_each(|v| *v *= alpha);
                    }
                }
            }
        }
        mask
    }

    /// Cosine between the screen normal and the ray from every pixel to the origin.
    pub fn cosine_map(&self, pose: &ScreenPose) -> Vec<f64> {
        let normal = pose.normal();
        let (w, h) = self.pixels;
        (0..w * h)
            .map(|i| {
                let pos = self.pixel_position(pose, (i % w) as f64, (i / w) as f64);
                normal.dot(&-pos) / (normal.norm() * pos.norm())
            })
            .collect()
    }

    /// Pixel shift that keeps content computed for `reference` in place on `current`.
    ///
    /// The ray from the origin through the old screen center is intersected
    /// with the new screen plane. The intersection, in millimeters along the new
    /// `right` and `down` axes, is converted to pixels. Returns `None` if the
    /// ray does not hit the new plane in front of the origin.
    pub fn shake_shift(&self, reference: &ScreenPose, current: &ScreenPose) -> Option<(f64, f64)> {
        let basis = Matrix3::from_columns(&[current.center, current.down, current.right]);
        let res = basis.try_inverse()? * reference.center;
        if res[0] <= f64::EPSILON || !res.iter().all(|v| v.is_finite()) {
            return None;
        }
        let (dx, dy) = self.pitch();
        Some((res[2] / res[0] / dx, res[1] / res[0] / dy))
    }
}
