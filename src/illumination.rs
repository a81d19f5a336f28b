//! The illumination state machine.
//!
//! Every [`IlluminationLoop::step`] takes the latest display pose and either
//! idles (no pose), shows the environment (show mode), rejects the position
//! with an operator cue, or runs one exposure:
//!
//! ```text
//! dark frame -> compute HDR frames -> open shutter -> display frames -> close
//!                                                        |
//!                                       anti-shake / drift / timing checks
//! ```
//!
//! A successful exposure is committed to the environment. A failed one leaves
//! it untouched.

use crate::{
    config::{DisplayCalibration, StageConfig},
    cube::CubeMap,
    devices::{CaptureRequest, Cue, DeviceBindings},
    environment::CubeEnvironment,
    error::Error,
    image::{ImageBackend, ParallelBackend, RadianceImage},
    output::{CommitDump, OutputLayout, TrackingLogEntry},
    screen::{ScreenGeometry, ScreenPose},
    sequencer::{HdrSequence, HdrSequencer},
    state::Pose,
    tracking::PoseSource,
};
use nalgebra::Vector3;
use std::{
    thread,
    time::{Duration, Instant},
};
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};
use uom::si::{angle::degree, length::millimeter};

/// What the loop does with a valid pose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageMode {
    /// Show the environment through the display response. No capture.
    Show,
    /// Stop after the first committed exposure.
    Single,
    /// Keep exposing until the environment is complete.
    Hold,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    /// Quit the loop, or abort the exposure in flight.
    Escape,
    /// Accept a position that fails the overlap check.
    Enter,
}

/// The fullscreen output of the hand-held display.
pub trait Display {
    /// Show a panel sized image of drive values in `[0, 1]`.
    fn show(&mut self, frame: &RadianceImage) -> Result<(), Error>;

    fn poll_key(&mut self) -> Option<Key>;
}

/// Why a position was not used. These are expected and frequent.
#[derive(Clone, Copy, Debug, PartialEq, ThisError)]
pub enum Rejection {
    #[error("only {0} markers visible")]
    TooFewMarkers(usize),
    #[error("position is unstable")]
    Unstable,
    #[error("screen is {0} mm away, too far")]
    TooFar(f64),
    #[error("screen is {0} mm away, too close")]
    TooClose(f64),
    #[error("light angle of {0} degrees is too steep")]
    Angle(f64),
    #[error("no overlap with the row above")]
    MissingTop,
    #[error("no overlap on either side")]
    MissingSide,
    #[error("{0} of the screen is already lit")]
    TooMuchOverlap(f64),
}

impl Rejection {
    /// Cue to play, if the operator has to react.
    pub fn cue(&self) -> Option<Cue> {
        match self {
            Self::TooFewMarkers(_) | Self::Unstable => None,
            Self::TooFar(_) => Some(Cue::Closer),
            Self::TooClose(_) => Some(Cue::Away),
            Self::Angle(degrees) => Some(Cue::for_angle(*degrees)),
            Self::MissingTop => Some(Cue::Top),
            Self::MissingSide => Some(Cue::More),
            Self::TooMuchOverlap(_) => Some(Cue::Less),
        }
    }

    /// Pause giving the operator time to react.
    pub fn cooldown(&self, cooldown: Duration) -> Duration {
        match self {
            Self::TooFewMarkers(_) | Self::Unstable => Duration::ZERO,
            Self::TooMuchOverlap(_) => cooldown / 2,
            _ => cooldown,
        }
    }
}

/// Why a started exposure was discarded.
#[derive(Debug, ThisError)]
pub enum CycleFailure {
    #[error("anti-shake shift ({0}, {1}) exceeds the border")]
    ShiftTooLarge(i64, i64),
    #[error("old screen center is not visible from the new pose")]
    Misaligned,
    #[error("screen moved {0} mm")]
    Drift(f64),
    #[error("displaying took {elapsed_ms} ms instead of {budget_ms} ms")]
    Timing { elapsed_ms: f64, budget_ms: f64 },
    #[error("aborted by the operator")]
    Aborted,
    #[error("capture failed: {0}")]
    Capture(Error),
}

/// Result of one loop iteration.
#[derive(Debug)]
pub enum Step {
    Idle,
    Shown,
    Rejected(Rejection),
    Committed { index: usize, scale: f64 },
    Failed(CycleFailure),
    Quit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: usize,
    pub failed: usize,
    pub rejected: usize,
    pub complete: bool,
}

/// Native panel geometry and where frames go on it.
#[derive(Clone, Debug, PartialEq)]
pub struct PanelLayout {
    size: (usize, usize),
    border: (usize, usize),
    active: ScreenGeometry,
    allowed_shift: (f64, f64),
}

impl PanelLayout {
    /// `display_scale` is the virtual to native resolution ratio the anti-shake
    /// allowance is measured in.
    pub fn new(
        calibration: &DisplayCalibration,
        ramp: (usize, usize),
        ramp_fraction: f64,
        display_scale: f64,
    ) -> Result<Self, Error> {
        let border = calibration.border_pixels();
        let active = ScreenGeometry::new(calibration.active_size(), calibration.active_size_mm())?;
        let allowance = |b: usize, r: usize| b as f64 + ramp_fraction / display_scale * r as f64;
        Ok(Self {
            size: calibration.panel_size(),
            border,
            active,
            allowed_shift: (allowance(border.0, ramp.0), allowance(border.1, ramp.1)),
        })
    }

    pub fn size(&self) -> (usize, usize) {
        self.size
    }

    /// The border free area at native resolution.
    pub fn active(&self) -> &ScreenGeometry {
        &self.active
    }

    pub fn allowed_shift(&self) -> (f64, f64) {
        self.allowed_shift
    }

    /// Frame offset without anti-shake.
    pub fn base_shift(&self) -> (i64, i64) {
        (self.border.0 as i64, self.border.1 as i64)
    }

    pub fn exceeds(&self, shift: (i64, i64)) -> bool {
        shift.0.abs() as f64 > self.allowed_shift.0 || shift.1.abs() as f64 > self.allowed_shift.1
    }

    pub fn black(&self) -> RadianceImage {
        RadianceImage::new(self.size.0, self.size.1)
    }

    /// A black panel with `frame` placed at `shift`.
    pub fn compose(&self, frame: &RadianceImage, shift: (i64, i64)) -> RadianceImage {
        let mut panel = self.black();
        panel.paste(frame, shift.0, shift.1);
        panel
    }
}

/// Everything built from the configuration before the loop starts.
#[derive(Clone, Debug)]
pub struct StageSetup<B: ImageBackend = ParallelBackend> {
    pub environment: CubeEnvironment<B>,
    pub panel: PanelLayout,
    pub sequencer: HdrSequencer,
    /// Screen center in board coordinates.
    pub screen_offset: Vector3<f64>,
    pub display_scale: f64,
}

impl<B: ImageBackend> StageSetup<B> {
    /// Scale the display model to the virtual resolution, prepare the
    /// environment map and derive the panel layout.
    pub fn prepare(
        config: &StageConfig,
        calibration: &DisplayCalibration,
        env_map: RadianceImage,
        backend: B,
    ) -> Result<Self, Error> {
        let mut svr = calibration.to_svr()?;
        let (panel_w, panel_h) = calibration.panel_size();
        let virtual_size = match config.virtual_screen_size {
            [0, _] | [_, 0] => (panel_w, panel_h),
            [w, h] => (w, h),
        };
        let display_scale = virtual_size.0 as f64 / panel_w as f64;
        svr.rescale(display_scale);
        let (usable_w, usable_h) = svr.usable_size();
        let virtual_active = (usable_w.round() as usize, usable_h.round() as usize);
        info!(
            ?virtual_size,
            ?virtual_active,
            display_scale,
            "virtual screen"
        );

        let mut map = env_map;
        if config.use_color_space_transform {
            map.transform_colors(svr.color_transform());
        }
        if config.env_map_exposure != 1.0 {
            let gain = config.env_map_exposure as f32;
            map.pixels_mut()
                .iter_mut()
                .for_each(|px| px.iter_mut().for_each(|v| *v *= gain));
        }
        if config.env_map_blur > 0.0 {
            map = map.blur(config.env_map_blur as f32);
        }
        if config.env_map_resize > 0.0 && config.env_map_resize != 1.0 {
            let w = (map.width() as f64 * config.env_map_resize).round() as usize;
            let h = (map.height() as f64 * config.env_map_resize).round() as usize;
            map = map.resize(w.max(1), h.max(1));
        }
        let cube = if CubeMap::is_strip(map.width(), map.height()) {
            CubeMap::from_strip(map)?
        } else {
            CubeMap::from_equirectangular(&map, config.cube_size, config.supersampling)?
        };

        let ramp = (config.border_ramp_size[0], config.border_ramp_size[1]);
        let geometry = ScreenGeometry::new(virtual_active, calibration.active_size_mm())?;
        let environment =
            CubeEnvironment::new(cube, svr, geometry, ramp, backend)?.with_cos_factor(config.use_cos_factor);

        let panel = PanelLayout::new(calibration, ramp, config.antishake_ramp_fraction, display_scale)?;
        let mut sequencer =
            HdrSequencer::new(config.hdr_sequence_size).with_blur(config.hdr_sequence_blur);
        if let Some(scale) = config.radiance_scale() {
            sequencer = sequencer.with_scale(scale);
        }
        if panel.active().pixels() != virtual_active {
            let (w, h) = panel.active().pixels();
            sequencer = sequencer.with_upscale(w, h);
        }

        Ok(Self {
            environment,
            panel,
            sequencer,
            screen_offset: calibration.screen_offset(),
            display_scale,
        })
    }
}

fn pause(seconds: f64) {
    if seconds > 0.0 && seconds.is_finite() {
        thread::sleep(Duration::from_secs_f64(seconds));
    }
}

/// Drives the display, the camera and the environment bookkeeping.
pub struct IlluminationLoop<P, D, B: ImageBackend = ParallelBackend> {
    env: CubeEnvironment<B>,
    panel: PanelLayout,
    sequencer: HdrSequencer,
    screen_offset: Vector3<f64>,
    devices: DeviceBindings,
    poses: P,
    display: D,
    output: OutputLayout,
    config: StageConfig,
    exposure_index: usize,
    current: Option<Pose>,
    footprint: Option<CubeMap>,
    overlap_override: bool,
    idle_loops: usize,
}

impl<P: PoseSource, D: Display, B: ImageBackend> IlluminationLoop<P, D, B> {
    pub fn new(
        setup: StageSetup<B>,
        devices: DeviceBindings,
        poses: P,
        display: D,
        output: OutputLayout,
        config: StageConfig,
    ) -> Self {
        Self {
            env: setup.environment,
            panel: setup.panel,
            sequencer: setup.sequencer,
            screen_offset: setup.screen_offset,
            devices,
            poses,
            display,
            output,
            config,
            exposure_index: 0,
            current: None,
            footprint: None,
            overlap_override: false,
            idle_loops: 0,
        }
    }

    /// Continue a run after exposure `index`.
    ///
    /// Returns false if its completed map could not be read and the run
    /// starts from scratch.
    pub fn resume(&mut self, index: usize) -> Result<bool, Error> {
        let Some(completed) = self.output.load_completed(index) else {
            return Ok(false);
        };
        self.env.resume(completed)?;
        self.exposure_index = index + 1;
        info!(index, "resumed from completed map");
        Ok(true)
    }

    pub fn environment(&self) -> &CubeEnvironment<B> {
        &self.env
    }

    /// Scale the environment into the display range before showing it.
    pub fn fit_to_display_range(&mut self) -> Result<(), Error> {
        self.env.fit_to_display_range()
    }

    pub fn exposure_index(&self) -> usize {
        self.exposure_index
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// Loop until the operator quits, the environment is complete or, in single
    /// mode, one exposure is committed.
    pub fn run(&mut self, mode: StageMode) -> Result<RunSummary, Error> {
        info!(?mode, start = self.exposure_index, "starting illumination");
        if let Err(err) = self.devices.backlight.set_backlight(1.0) {
            warn!(%err, "could not set backlight");
        }
        self.devices.cue(Cue::Start);

        let mut summary = RunSummary::default();
        loop {
            if mode != StageMode::Show && self.env.is_complete() {
                summary.complete = true;
                break;
            }
            match self.step(mode)? {
                Step::Quit => break,
                Step::Committed { .. } => {
                    summary.committed += 1;
                    if mode == StageMode::Single {
                        break;
                    }
                }
                Step::Failed(_) => summary.failed += 1,
                Step::Rejected(_) => summary.rejected += 1,
                Step::Idle | Step::Shown => {}
            }
        }

        info!(
            exposures = self.exposure_index,
            committed = summary.committed,
            failed = summary.failed,
            "illumination finished"
        );
        self.devices.cue(Cue::Finish);
        Ok(summary)
    }

    /// One iteration of the main loop.
    pub fn step(&mut self, mode: StageMode) -> Result<Step, Error> {
        match self.display.poll_key() {
            Some(Key::Escape) => return Ok(Step::Quit),
            Some(Key::Enter) => self.overlap_override = true,
            None => {}
        }

        let Some((pose, fixed)) = self.acquire_pose(mode) else {
            if mode != StageMode::Show {
                self.idle()?;
            }
            return Ok(Step::Idle);
        };
        let stage_origin = self.config.stage_origin();
        let screen = pose.screen_pose(&self.screen_offset, &stage_origin);

        if mode == StageMode::Show {
            self.show(&screen)?;
            return Ok(Step::Shown);
        }

        let verdict = self.validate(&pose, fixed, &screen)?;
        self.footprint = Some(self.env.footprint(&screen)?);
        if let Err(rejection) = verdict {
            debug!(index = self.exposure_index, %rejection, "position rejected");
            if let Some(cue) = rejection.cue() {
                self.devices.cue(cue);
            }
            thread::sleep(rejection.cooldown(Duration::from_millis(self.config.cooldown_ms)));
            return Ok(Step::Rejected(rejection));
        }
        self.overlap_override = false;

        let started = Instant::now();
        let index = self.exposure_index;
        let sequence = match self.expose(&screen)? {
            Ok(sequence) => sequence,
            Err(failure) => {
                error!(index, %failure, "illumination failed");
                self.devices.cue(Cue::Error);
                thread::sleep(Duration::from_millis(self.config.failure_cooldown_ms));
                return Ok(Step::Failed(failure));
            }
        };
        self.devices.cue(Cue::ProcessingEnd);
        self.commit(&pose, &screen, &sequence)?;

        if mode != StageMode::Single {
            pause(2.0 - started.elapsed().as_secs_f64());
        }
        Ok(Step::Committed {
            index,
            scale: sequence.scale,
        })
    }

    fn acquire_pose(&mut self, mode: StageMode) -> Option<(Pose, bool)> {
        if mode == StageMode::Single && self.config.fixed_camera {
            return Some((self.config.fixed_pose(), true));
        }

        let fixed = self.poses.is_fixed();
        if self.poses.has_new_data() {
            if let Some(pose) = self.poses.pose() {
                if fixed || pose.markers >= self.config.num_markers_required {
                    self.current = Some(pose);
                } else {
                    debug!(markers = pose.markers, "not enough markers visible");
                }
            }
        } else if self
            .poses
            .last_time_ms()
            .is_some_and(|ms| ms > u128::from(self.config.stale_after_ms))
            && self.current.take().is_some()
        {
            info!(index = self.exposure_index, "lost position after timeout");
        }
        self.current.map(|pose| (pose, fixed))
    }

    fn idle(&mut self) -> Result<(), Error> {
        let (w, h) = self.panel.size();
        let view = self.env.progress_view(self.footprint.as_ref(), w, h)?;
        self.display.show(&view)?;
        if self.idle_loops % 5 == 0 {
            self.devices.cue(Cue::Search);
        }
        self.idle_loops += 1;
        thread::sleep(Duration::from_millis(self.config.idle_interval_ms));
        Ok(())
    }

    fn show(&mut self, screen: &ScreenPose) -> Result<(), Error> {
        let started = Instant::now();
        let mut view = self.env.show_environment(screen)?;
        self.env.svr().apply_response_screen(&mut view);
        debug!(took_ms = started.elapsed().as_millis() as u64, "sampled environment");

        let (w, h) = self.panel.active().pixels();
        let frame = view.resize(w, h);
        let panel = self.panel.compose(&frame, self.panel.base_shift());
        self.display.show(&panel)
    }

    fn validate(
        &self,
        pose: &Pose,
        fixed: bool,
        screen: &ScreenPose,
    ) -> Result<Result<(), Rejection>, Error> {
        if !fixed && pose.markers < self.config.num_markers_required {
            return Ok(Err(Rejection::TooFewMarkers(pose.markers)));
        }
        if !self
            .poses
            .has_stable_position(self.config.stable_positions, self.config.stability_tolerance)
        {
            return Ok(Err(Rejection::Unstable));
        }

        let distance = screen.distance();
        let (near, far) = self.config.stage_distance_range();
        if distance > far {
            return Ok(Err(Rejection::TooFar(distance.get::<millimeter>())));
        }
        if distance < near {
            return Ok(Err(Rejection::TooClose(distance.get::<millimeter>())));
        }

        let angle = self.env.max_angle(screen);
        if angle > self.config.angle_tolerance() {
            return Ok(Err(Rejection::Angle(angle.get::<degree>())));
        }

        if self.config.use_overlap_check && self.exposure_index > 0 && !self.overlap_override {
            return self.check_overlap(screen);
        }
        Ok(Ok(()))
    }

    /// Require the new position to continue the lit area without covering too much of it.
    fn check_overlap(&self, screen: &ScreenPose) -> Result<Result<(), Rejection>, Error> {
        let lit = self.env.project_completed(screen)?;
        let (w, h) = lit.dimensions();
        let red = |x: usize, y: usize| lit.get(x, y).map_or(0.0, |px| f64::from(px[0]));
        let slack = self.config.overlap_slack;

        let line = if self.config.use_bottom_line {
            h.saturating_sub(1)
        } else {
            0
        };
        let has_top = (0..w).map(|x| red(x, line)).sum::<f64>() >= w as f64 - slack;

        let span = self.config.overlap_border_length;
        let offset = (h as f64 * (1.0 - span) / 2.0) as usize;
        let rows = offset..h.saturating_sub(offset);
        let needed = h as f64 * span - slack;
        let has_left = rows.clone().map(|y| red(0, y)).sum::<f64>() >= needed;
        let has_right = rows.map(|y| red(w.saturating_sub(1), y)).sum::<f64>() >= needed;
        debug!(has_top, has_left, has_right, "overlap");

        if !self.config.is_first_row && !has_top {
            return Ok(Err(Rejection::MissingTop));
        }
        if !has_left && !has_right {
            return Ok(Err(Rejection::MissingSide));
        }
        let covered = f64::from(lit.mean());
        if covered > self.config.max_covered {
            return Ok(Err(Rejection::TooMuchOverlap(covered)));
        }
        Ok(Ok(()))
    }

    /// Capture one exposure while displaying the frames for `reference`.
    fn expose(&mut self, reference: &ScreenPose) -> Result<Result<HdrSequence, CycleFailure>, Error> {
        let index = self.exposure_index;
        let capture = self.devices.capture_controller();
        self.display.show(&self.panel.black())?;

        let dark = if self.config.use_blackframe {
            pause(self.config.capture_wait);
            Some(capture.start(CaptureRequest::new(
                self.output.dark_frame_path(index),
                self.config.blackframe_exposure,
                self.config.dslr_aperture,
            )))
        } else {
            None
        };

        self.devices.cue(Cue::ProcessingStart);
        let started = Instant::now();
        let sequence = self.env.calc_hdr_frames(reference, &self.sequencer)?;
        info!(
            index,
            frames = sequence.frames.len(),
            scale = sequence.scale,
            took_ms = started.elapsed().as_millis() as u64,
            "computed HDR frames"
        );

        if let Some(dark) = dark {
            if let Err(err) = dark.wait() {
                return Ok(Err(CycleFailure::Capture(err)));
            }
        }

        let shutter = capture.start(CaptureRequest::new(
            self.output.capture_path(index),
            self.config.dslr_exposure,
            self.config.dslr_aperture,
        ));
        pause(self.config.capture_wait);

        let displayed = self.display_sequence(index, reference, &sequence.frames);
        let captured = shutter.wait();
        let mut failure = displayed?;
        if let Err(err) = captured {
            match failure {
                Some(_) => warn!(%err, "capture failed as well"),
                None => failure = Some(CycleFailure::Capture(err)),
            }
        }
        if failure.is_none() && self.display.poll_key() == Some(Key::Escape) {
            failure = Some(CycleFailure::Aborted);
        }

        Ok(match failure {
            Some(failure) => Err(failure),
            None => Ok(sequence),
        })
    }

    /// Show the frames at the configured rate, following small movements.
    fn display_sequence(
        &mut self,
        index: usize,
        reference: &ScreenPose,
        frames: &[RadianceImage],
    ) -> Result<Option<CycleFailure>, Error> {
        let Some(first) = frames.first() else {
            return Ok(None);
        };
        let period = 1.0 / self.config.hdr_sequence_fps;
        let budget = frames.len() as f64 * period;
        let mut current = *reference;
        let mut shift = self.panel.base_shift();

        let mut failure = self.track(index, 0, reference, &mut current, &mut shift)?;
        let mut panel = self.panel.compose(first, shift);
        self.devices.cue(Cue::CaptureStart);
        let started = Instant::now();

        if failure.is_none() {
            for f in 0..frames.len() {
                let shown = Instant::now();
                self.display.show(&panel)?;
                if let Some(next) = frames.get(f + 1) {
                    failure = self.track(index, f, reference, &mut current, &mut shift)?;
                    if failure.is_some() {
                        break;
                    }
                    panel = self.panel.compose(next, shift);
                }
                pause(period - shown.elapsed().as_secs_f64());
            }
        }
        let elapsed = started.elapsed().as_secs_f64();
        self.display.show(&self.panel.black())?;
        self.devices.cue(Cue::CaptureEnd);

        debug!(index, elapsed_ms = elapsed * 1e3, "displayed HDR frames");
        if failure.is_none() && elapsed > (1.0 + self.config.timing_tolerance) * budget {
            failure = Some(CycleFailure::Timing {
                elapsed_ms: elapsed * 1e3,
                budget_ms: budget * 1e3,
            });
        }
        let drift = reference.drift(&current);
        if failure.is_none() && drift > self.config.allowed_drift() {
            failure = Some(CycleFailure::Drift(drift.get::<millimeter>()));
        }
        Ok(failure)
    }

    /// Take a fresh pose, if any, and update the frame shift for it.
    fn track(
        &mut self,
        index: usize,
        frame: usize,
        reference: &ScreenPose,
        current: &mut ScreenPose,
        shift: &mut (i64, i64),
    ) -> Result<Option<CycleFailure>, Error> {
        if !self.poses.has_new_data() {
            return Ok(None);
        }
        let Some(pose) = self.poses.pose() else {
            return Ok(None);
        };
        let stage_origin = self.config.stage_origin();
        *current = pose.screen_pose(&self.screen_offset, &stage_origin);
        self.output.log_tracking(&TrackingLogEntry {
            index,
            frame: Some((frame, *shift)),
            error: pose.error,
            markers: pose.markers,
            position: pose.stage_position(&stage_origin),
            screen: *current,
            angle: current.max_angle().get::<degree>(),
        })?;

        if self.config.use_anti_shake {
            let Some((dx, dy)) = self.panel.active().shake_shift(reference, current) else {
                return Ok(Some(CycleFailure::Misaligned));
            };
            let (bx, by) = self.panel.base_shift();
            *shift = (bx + dx.round() as i64, by + dy.round() as i64);
            if self.panel.exceeds(*shift) {
                return Ok(Some(CycleFailure::ShiftTooLarge(shift.0, shift.1)));
            }
        } else {
            let drift = reference.drift(current);
            if drift > self.config.allowed_drift() {
                return Ok(Some(CycleFailure::Drift(drift.get::<millimeter>())));
            }
        }
        Ok(None)
    }

    fn commit(&mut self, pose: &Pose, screen: &ScreenPose, sequence: &HdrSequence) -> Result<(), Error> {
        let index = self.exposure_index;
        self.env.commit()?;

        let stage_origin = self.config.stage_origin();
        self.output.log_tracking(&TrackingLogEntry {
            index,
            frame: None,
            error: pose.error,
            markers: pose.markers,
            position: pose.stage_position(&stage_origin),
            screen: *screen,
            angle: screen.max_angle().get::<degree>(),
        })?;
        self.output.log_exposure(index, sequence.scale)?;

        let tracking = self.poses.debug_image();
        self.output.dump_commit(
            index,
            &CommitDump {
                required: self.env.required(),
                frames: &sequence.frames,
                tracking: tracking.as_ref(),
                remaining: self.env.remaining(),
                used: self.env.used(),
                completed: self.env.completed(),
            },
        )?;
        info!(index, scale = sequence.scale, "committed exposure");
        self.exposure_index += 1;
        Ok(())
    }
}
