use crate::screen::ScreenPose;
use chrono::prelude::*;
use nalgebra::{Matrix3, Matrix3x4, Vector3};
use serde::{Deserialize, Serialize};

/// Tracked pose of the hand-held display's marker board, in the tracking camera frame.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Pose {
    /// Board to camera rotation.
    pub rotation: Matrix3<f64>,

    /// Board origin in camera coordinates (millimeters).
    pub position: Vector3<f64>,

    /// Reprojection error normalized by the marker count.
    pub error: f64,

    /// Markers used by the solve.
    pub markers: usize,

    pub timestamp: DateTime<Utc>,
}

impl Pose {
    /// A pose that never changes, e.g. a display mounted on a fixed arm.
    pub fn fixed(rotation: Matrix3<f64>, position: Vector3<f64>) -> Self {
        Self {
            rotation,
            position,
            error: 0.0,
            markers: 0,
            timestamp: Utc::now(),
        }
    }

    /// Derive the board pose from a world to camera rigid transform `[R | t]`.
    ///
    /// The board rotation is `R^-1` and its position is `-R^-1 t`. Returns `None`
    /// if `R` is singular.
    pub fn from_transform(transform: &Matrix3x4<f64>, error: f64, markers: usize) -> Option<Self> {
        let r: Matrix3<f64> = transform.fixed_view::<3, 3>(0, 0).into_owned();
        let t: Vector3<f64> = transform.column(3).into_owned();
        let rotation = r.try_inverse()?;
        Some(Self {
            rotation,
            position: -(rotation * t),
            error,
            markers,
            timestamp: Utc::now(),
        })
    }

    /// Board position relative to the stage origin.
    pub fn stage_position(&self, stage_origin: &Vector3<f64>) -> Vector3<f64> {
        self.position - stage_origin
    }

    /// Where the screen is for this board pose.
    ///
    /// `screen_offset` is the screen center in board coordinates. Screen rows run
    /// along the board's y axis and columns against its x axis.
    pub fn screen_pose(
        &self,
        screen_offset: &Vector3<f64>,
        stage_origin: &Vector3<f64>,
    ) -> ScreenPose {
        ScreenPose::new(
            self.stage_position(stage_origin) + self.rotation * screen_offset,
            self.rotation.column(1).into_owned(),
            -self.rotation.column(0).into_owned(),
        )
    }

    /// Milliseconds elapsed since the pose was taken.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn transform_inverts_to_board_pose() {
        let r = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let t = Vector3::new(10.0, 20.0, 30.0);
        let transform = Matrix3x4::from_columns(&[
            r.column(0).into_owned(),
            r.column(1).into_owned(),
            r.column(2).into_owned(),
            t,
        ]);

        let pose = Pose::from_transform(&transform, 0.5, 4).unwrap();
        assert_relative_eq!(pose.rotation, r.transpose(), epsilon = 1e-12);
        // Mapping the board origin back into the camera frame gives t.
        assert_relative_eq!(r * pose.position + t, Vector3::zeros(), epsilon = 1e-12);
        assert_eq!(pose.markers, 4);
    }

    #[test]
    fn singular_transform_is_rejected() {
        assert!(Pose::from_transform(&Matrix3x4::zeros(), 0.0, 1).is_none());
    }

    #[test]
    fn screen_axes_follow_board() {
        let pose = Pose::fixed(Matrix3::identity(), Vector3::new(100.0, 0.0, 0.0));
        let screen = pose.screen_pose(&Vector3::new(0.0, 0.0, 5.0), &Vector3::new(10.0, 0.0, 0.0));
        assert_relative_eq!(screen.center, Vector3::new(90.0, 0.0, 5.0));
        assert_eq!(screen.down, Vector3::y());
        assert_eq!(screen.right, -Vector3::x());
    }
}
