//! Plane to plane projective transforms.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};

/// Smallest homogeneous scale accepted when mapping a point.
const W_EPSILON: f64 = 1e-12;

/// A planar projective transform.
///
/// The matrix is sign normalized so that points on the near side of the projection
/// center have a positive homogeneous coordinate. Points on the far side map to
/// `None` instead of wrapping around through infinity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Solve for the transform taking each `src[i]` to `dst[i]`.
    ///
    /// Returns `None` if the correspondences are degenerate (collinear points,
    /// non-finite input) or if they do not all lie on the same side of the
    /// projection center.
    pub fn from_correspondences(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Self> {
        if src.iter().chain(dst.iter()).any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return None;
        }

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
            let r = 2 * i;
            a[(r, 0)] = s.x;
            a[(r, 1)] = s.y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -s.x * d.x;
            a[(r, 7)] = -s.y * d.x;
            b[r] = d.x;

            a[(r + 1, 3)] = s.x;
            a[(r + 1, 4)] = s.y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -s.x * d.y;
            a[(r + 1, 7)] = -s.y * d.y;
            b[r + 1] = d.y;
        }

        let h = a.lu().solve(&b)?;
        if h.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let mut matrix = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        if homogeneous(&matrix, &src[0]).z < 0.0 {
            matrix = -matrix;
        }
        if src.iter().any(|p| homogeneous(&matrix, p).z <= W_EPSILON) {
            return None;
        }

        Some(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Map a point, or `None` if it lies on the far side of the projection center.
    pub fn apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = homogeneous(&self.matrix, &p);
        if v.z <= W_EPSILON {
            return None;
        }
        Some(Point2::new(v.x / v.z, v.y / v.z))
    }

    /// The inverse transform. Sign normalization carries over because the inverse
    /// of a positive-scale mapping has a positive scale as well.
    pub fn inverse(&self) -> Option<Self> {
        self.matrix.try_inverse().map(|matrix| Self { matrix })
    }
}

fn homogeneous(matrix: &Matrix3<f64>, p: &Point2<f64>) -> Vector3<f64> {
    matrix * Vector3::new(p.x, p.y, 1.0)
}
