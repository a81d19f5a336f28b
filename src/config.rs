//! JSON configuration files.
//!
//! Three files set up a run: the light stage parameters ([`StageConfig`]), the
//! display calibration ([`DisplayCalibration`]) and the marker board layout
//! ([`MarkerConfig`]). Raw numbers are millimeters, degrees and seconds.

use crate::{
    camera::{CameraIntrinsics, UndistortMap},
    error::Error,
    state::Pose,
    svr::{Patch, SvrInfo},
    tracking::{FramePreprocessor, TrackerSettings},
};
use nalgebra::{Matrix3, Matrix3x4, Vector3};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fs, path::Path, path::PathBuf};
use tracing::{info, warn};
use uom::si::{
    angle::degree,
    f64::{Angle, Length},
    length::millimeter,
};

fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, Error> {
    let text = fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&text)?)
}

/// Parameters of the light stage and the illumination procedure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub marker_config: Option<PathBuf>,
    pub num_markers_required: usize,

    /// Distance of the screen center from the stage origin.
    pub stage_radius: f64,
    pub stage_radius_tolerance: f64,
    /// Steepest accepted light angle in degrees.
    pub stage_angle_tolerance: f64,
    /// Largest screen movement during one exposure.
    pub allowed_drift: f64,
    /// Radius the last tracked positions must stay within.
    pub stability_tolerance: f64,
    pub stage_origin: [f64; 3],

    pub fixed_camera: bool,
    /// Rows of the fixed board rotation.
    pub camera_rotation: [[f64; 3]; 3],
    pub camera_position: [f64; 3],

    /// Resolution the frames are computed at, border included.
    pub virtual_screen_size: [usize; 2],
    pub border_ramp_size: [usize; 2],
    pub hdr_sequence_size: usize,
    pub hdr_sequence_fps: f64,
    pub hdr_sequence_blur: f64,

    /// Seconds to wait around a remote capture.
    pub capture_wait: f64,
    pub dslr_exposure: f64,
    pub dslr_aperture: f64,
    pub use_blackframe: bool,
    pub blackframe_exposure: f64,

    pub use_overlap_check: bool,
    pub is_first_row: bool,
    pub use_bottom_line: bool,

    /// Intrinsics of the tracking camera. Frames are undistorted when set.
    pub camera_intrinsics: Option<PathBuf>,
    /// Writes one tracking frame to the file given as its argument.
    pub tracking_frame_command: Option<String>,
    /// Detects the marker board, see [`crate::tracking::CommandDetector`].
    pub marker_detection_command: Option<String>,
    pub tracking_threshold: u8,
    pub tracking_use_inverted: bool,
    pub tracking_use_color: bool,
    pub tracking_auto_threshold: bool,

    pub env_map: PathBuf,
    pub env_map_exposure: f64,
    pub env_map_blur: f64,
    pub env_map_resize: f64,
    pub cube_size: usize,
    pub supersampling: usize,
    /// Fixed radiance scale. Zero or negative selects the automatic scale.
    pub radiance_multiplier: f64,
    pub use_cos_factor: bool,
    pub use_color_space_transform: bool,
    pub use_anti_shake: bool,

    pub dump_tracking_image: bool,
    pub dump_tracking_log: bool,
    pub dump_screen: bool,
    pub dump_hdr_frames: bool,
    pub dump_env_map_used: bool,
    pub dump_env_map_remaining: bool,
    pub dump_env_map_completed: bool,

    pub remote_capture_command: String,
    pub sound_notification_command: String,
    pub backlight_control_command: String,

    /// Pixels of an overlap edge that may be missing.
    pub overlap_slack: f64,
    /// Share of the side edges checked for overlap.
    pub overlap_border_length: f64,
    /// Largest accepted overlap with completed regions.
    pub max_covered: f64,
    /// Share of the border ramp anti-shake may crop.
    pub antishake_ramp_fraction: f64,
    /// Accepted display overrun as a share of the sequence duration.
    pub timing_tolerance: f64,
    pub stale_after_ms: u64,
    pub stable_positions: usize,
    /// Pause after a rejected position.
    pub cooldown_ms: u64,
    /// Pause after a failed exposure.
    pub failure_cooldown_ms: u64,
    pub idle_interval_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            marker_config: None,
            num_markers_required: 4,
            stage_radius: 1000.0,
            stage_radius_tolerance: 50.0,
            stage_angle_tolerance: 5.0,
            allowed_drift: 10.0,
            stability_tolerance: 10.0,
            stage_origin: [0.0; 3],
            fixed_camera: false,
            camera_rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            camera_position: [0.0; 3],
            virtual_screen_size: [0, 0],
            border_ramp_size: [0, 0],
            hdr_sequence_size: 10,
            hdr_sequence_fps: 30.0,
            hdr_sequence_blur: 0.0,
            capture_wait: 0.5,
            dslr_exposure: 1.0,
            dslr_aperture: 8.0,
            use_blackframe: false,
            blackframe_exposure: 1.0,
            use_overlap_check: false,
            is_first_row: false,
            use_bottom_line: false,
            camera_intrinsics: None,
            tracking_frame_command: None,
            marker_detection_command: None,
            tracking_threshold: 100,
            tracking_use_inverted: false,
            tracking_use_color: false,
            tracking_auto_threshold: false,
            env_map: PathBuf::new(),
            env_map_exposure: 1.0,
            env_map_blur: 0.0,
            env_map_resize: 1.0,
            cube_size: 1000,
            supersampling: 5,
            radiance_multiplier: 0.0,
            use_cos_factor: false,
            use_color_space_transform: false,
            use_anti_shake: false,
            dump_tracking_image: false,
            dump_tracking_log: false,
            dump_screen: false,
            dump_hdr_frames: false,
            dump_env_map_used: false,
            dump_env_map_remaining: false,
            dump_env_map_completed: true,
            remote_capture_command: "sh remote_canon.sh".into(),
            sound_notification_command: "sh sound_notification.sh".into(),
            backlight_control_command: "sh set_backlight.sh".into(),
            overlap_slack: 10.0,
            overlap_border_length: 0.5,
            max_covered: 0.5,
            antishake_ramp_fraction: 0.25,
            timing_tolerance: 0.05,
            stale_after_ms: 2000,
            stable_positions: 10,
            cooldown_ms: 1000,
            failure_cooldown_ms: 1500,
            idle_interval_ms: 200,
        }
    }
}

impl StageConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.hdr_sequence_size == 0 {
            return Err(Error::InvalidInput(
                "hdr_sequence_size must be at least 1".into(),
            ));
        }
        if !(self.hdr_sequence_fps > 0.0) {
            return Err(Error::InvalidInput(format!(
                "hdr_sequence_fps must be positive but is {}",
                self.hdr_sequence_fps
            )));
        }
        if self.cube_size == 0 {
            return Err(Error::InvalidInput("cube_size must be positive".into()));
        }
        if self.supersampling % 2 == 0 {
            return Err(Error::InvalidInput(format!(
                "supersampling must be odd but is {}",
                self.supersampling
            )));
        }
        Ok(())
    }

    /// Fixed radiance scale, or `None` for the automatic one.
    pub fn radiance_scale(&self) -> Option<f64> {
        (self.radiance_multiplier > 0.0).then_some(self.radiance_multiplier)
    }

    pub fn stage_origin(&self) -> Vector3<f64> {
        Vector3::from(self.stage_origin)
    }

    /// Board pose for a display on a fixed mount.
    pub fn fixed_pose(&self) -> Pose {
        let r = self.camera_rotation;
        let rotation = Matrix3::new(
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        );
        Pose::fixed(rotation, Vector3::from(self.camera_position))
    }

    /// Frame preparation for the marker detector.
    pub fn preprocessor(&self) -> Result<FramePreprocessor, Error> {
        let undistort = match &self.camera_intrinsics {
            Some(path) => Some(UndistortMap::new(&CameraIntrinsics::load(path)?)),
            None => None,
        };
        Ok(FramePreprocessor::new(
            undistort,
            !self.tracking_use_color,
            self.tracking_use_inverted,
        ))
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            threshold: self.tracking_threshold,
            auto_threshold: self.tracking_auto_threshold,
            min_markers: self.num_markers_required,
            debug: self.dump_tracking_image,
        }
    }

    /// Accepted screen distances from the stage origin.
    pub fn stage_distance_range(&self) -> (Length, Length) {
        (
            Length::new::<millimeter>(self.stage_radius - self.stage_radius_tolerance),
            Length::new::<millimeter>(self.stage_radius + self.stage_radius_tolerance),
        )
    }

    pub fn angle_tolerance(&self) -> Angle {
        Angle::new::<degree>(self.stage_angle_tolerance)
    }

    pub fn allowed_drift(&self) -> Length {
        Length::new::<millimeter>(self.allowed_drift)
    }
}

/// Display calibration written by the calibration tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayCalibration {
    /// Exposure time used while calibrating.
    pub exposure_time: f64,
    pub aperture: f64,
    /// Native panel resolution.
    pub screen_size: [f64; 2],
    /// Physical panel size in millimeters.
    pub screen_size_mm: [f64; 2],
    /// Unused pixels along the vertical and horizontal edges.
    pub border_size: [f64; 2],
    /// Screen center in board coordinates (millimeters).
    pub screen_position: [f64; 3],
    /// Rows of the camera to display color matrix.
    #[serde(default)]
    pub color_transform: Option<[[f32; 3]; 3]>,
    pub patch_layout: [usize; 2],
    pub patch_size: f64,
    pub patches: Vec<Patch>,
}

impl DisplayCalibration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        load_json(path)
    }

    /// Check the patch geometry and build the response model at native resolution.
    ///
    /// Non-monotonic response curves are repaired on the way.
    pub fn to_svr(&self) -> Result<SvrInfo, Error> {
        let mut svr = SvrInfo::new(
            self.patches.clone(),
            (self.patch_layout[0], self.patch_layout[1]),
            self.patch_size,
            (self.screen_size[0], self.screen_size[1]),
            (self.border_size[0], self.border_size[1]),
        )?
        .with_exposure(self.exposure_time);
        if let Some(m) = self.color_transform {
            svr = svr.with_color_transform(Matrix3::new(
                m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
            ));
        }
        svr.check_values()?;

        let repaired = svr.repair_monotonicity();
        if repaired > 0 {
            warn!(repaired, "repaired non-monotonic response samples");
        }
        info!(
            patches = self.patches.len(),
            layout = ?self.patch_layout,
            "loaded display calibration"
        );
        Ok(svr)
    }

    pub fn screen_offset(&self) -> Vector3<f64> {
        Vector3::from(self.screen_position)
    }

    /// Native panel resolution in whole pixels.
    pub fn panel_size(&self) -> (usize, usize) {
        (self.screen_size[0] as usize, self.screen_size[1] as usize)
    }

    pub fn border_pixels(&self) -> (usize, usize) {
        (self.border_size[0] as usize, self.border_size[1] as usize)
    }

    /// Native resolution of the area inside the border.
    pub fn active_size(&self) -> (usize, usize) {
        let (w, h) = self.panel_size();
        let (bw, bh) = self.border_pixels();
        (w.saturating_sub(2 * bw), h.saturating_sub(2 * bh))
    }

    /// Physical size of the area inside the border.
    pub fn active_size_mm(&self) -> (f64, f64) {
        let [w, h] = self.screen_size_mm;
        (
            w - w / self.screen_size[0] * 2.0 * self.border_size[0],
            h - h / self.screen_size[1] * 2.0 * self.border_size[1],
        )
    }
}

/// One marker of the board.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerDefinition {
    pub id: u32,
    /// Edge length in millimeters.
    pub width: f64,
    /// Rows of the marker to board transform.
    pub transform: [[f64; 4]; 3],
}

impl MarkerDefinition {
    pub fn transform(&self) -> Matrix3x4<f64> {
        Matrix3x4::from_fn(|r, c| self.transform[r][c])
    }
}

/// Layout of the multi-marker board.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub markers: Vec<MarkerDefinition>,
}

impl MarkerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config: Self = load_json(path.as_ref())?;
        if config.markers.is_empty() {
            return Err(Error::Tracking(format!(
                "marker configuration {} lists no markers",
                path.as_ref().display()
            )));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn calibration() -> DisplayCalibration {
        let patch = Patch {
            min: [0.0; 3],
            max: [1.0; 3],
            response: vec![[0.0; 3], [0.6; 3], [0.5; 3], [1.0; 3]],
        };
        DisplayCalibration {
            exposure_time: 0.25,
            aperture: 8.0,
            screen_size: [12.0, 8.0],
            screen_size_mm: [120.0, 80.0],
            border_size: [2.0, 2.0],
            screen_position: [0.0, 0.0, 10.0],
            color_transform: None,
            patch_layout: [2, 1],
            patch_size: 4.0,
            patches: vec![patch.clone(), patch],
        }
    }

    #[test]
    fn partial_stage_config_uses_defaults() {
        let config: StageConfig =
            serde_json::from_str(r#"{ "stage_radius": 800.0, "hdr_sequence_size": 3 }"#).unwrap();
        assert_eq!(config.stage_radius, 800.0);
        assert_eq!(config.hdr_sequence_size, 3);
        assert_eq!(config.overlap_slack, 10.0);
        assert_eq!(config.radiance_scale(), None);
        let (lo, hi) = config.stage_distance_range();
        assert_relative_eq!(lo.get::<millimeter>(), 750.0);
        assert_relative_eq!(hi.get::<millimeter>(), 850.0);
    }

    #[test]
    fn rejects_unusable_settings() {
        let config = StageConfig {
            hdr_sequence_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StageConfig {
            supersampling: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tracking_settings_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let intrinsics = dir.path().join("camera.json");
        fs::write(
            &intrinsics,
            r#"{ "fx": 10.0, "fy": 10.0, "cx": 2.0, "cy": 2.0, "resolution": [4, 4] }"#,
        )
        .unwrap();
        let config = StageConfig {
            camera_intrinsics: Some(intrinsics),
            num_markers_required: 3,
            tracking_threshold: 60,
            tracking_use_inverted: true,
            tracking_auto_threshold: true,
            dump_tracking_image: true,
            ..Default::default()
        };

        let settings = config.tracker_settings();
        assert_eq!(settings.threshold, 60);
        assert_eq!(settings.min_markers, 3);
        assert!(settings.auto_threshold && settings.debug);

        let pre = config.preprocessor().unwrap();
        assert_eq!(pre.detection_threshold(60), 195);
        let frame = pre.process(image::RgbImage::new(6, 6));
        assert_eq!(frame.as_luma8().map(|f| f.dimensions()), Some((4, 4)));

        let missing = StageConfig {
            camera_intrinsics: Some(dir.path().join("nope.json")),
            ..Default::default()
        };
        assert!(missing.preprocessor().is_err());
    }

    #[test]
    fn calibration_builds_repaired_model() {
        let cal = calibration();
        let svr = cal.to_svr().unwrap();
        assert_eq!(svr.patches()[0].response[1], [0.5; 3]);
        assert_eq!(svr.exposure(), 0.25);
        assert_eq!(cal.active_size(), (8, 4));
        let (w, h) = cal.active_size_mm();
        assert_relative_eq!(w, 80.0);
        assert_relative_eq!(h, 40.0);
    }

    #[test]
    fn calibration_with_wrong_layout_fails() {
        let mut cal = calibration();
        cal.patch_layout = [1, 2];
        assert!(matches!(cal.to_svr(), Err(Error::Calibration(_))));
    }

    #[test]
    fn empty_marker_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        fs::write(&path, r#"{ "markers": [] }"#).unwrap();
        assert!(matches!(MarkerConfig::load(&path), Err(Error::Tracking(_))));

        fs::write(
            &path,
            r#"{ "markers": [ { "id": 3, "width": 40.0,
                 "transform": [[1,0,0,5],[0,1,0,6],[0,0,1,7]] } ] }"#,
        )
        .unwrap();
        let config = MarkerConfig::load(&path).unwrap();
        assert_eq!(config.markers[0].transform()[(1, 3)], 6.0);
    }

    #[test]
    fn fixed_pose_uses_configured_rotation() {
        let config = StageConfig {
            camera_rotation: [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            camera_position: [1.0, 2.0, 3.0],
            ..Default::default()
        };
        let pose = config.fixed_pose();
        assert_eq!(pose.rotation[(0, 1)], -1.0);
        assert_eq!(pose.position, Vector3::new(1.0, 2.0, 3.0));
    }
}
