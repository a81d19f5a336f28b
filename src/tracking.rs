//! Marker based pose tracking of the hand-held display.
//!
//! A background thread grabs camera frames, prepares them for the marker
//! detector and publishes every successful solve into a mutex guarded state.
//! The illumination loop reads that state through a [`TrackerGuard`], which
//! keeps the pose, error and marker count consistent while it is held. A solve
//! finishing in the meantime waits for the guard to drop and then lands as one
//! update.

use crate::{
    camera::UndistortMap,
    config::{MarkerConfig, StageConfig},
    devices::ShellCommand,
    error::Error,
    state::Pose,
};
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use nalgebra::{Matrix3x4, Vector3};
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Number of positions kept for the stability check.
pub const POSITION_HISTORY: usize = 20;

/// Delivers camera frames, blocking until the next one is available.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<RgbImage, Error>;
}

/// Finds the marker board in a prepared frame.
pub trait MarkerDetector: Send {
    /// Detect at the binarization `threshold`. `Ok(None)` means no marker was found.
    fn detect(&mut self, frame: &DynamicImage, threshold: u8)
    -> Result<Option<MarkerSolution>, Error>;
}

/// Result of a multi-marker solve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerSolution {
    /// World to camera transform `[R | t]`.
    pub transform: Matrix3x4<f64>,

    /// Raw reprojection error. Negative if the solve failed.
    pub error: f64,

    /// Markers of the configuration that were visible.
    pub markers: usize,
}

impl MarkerSolution {
    /// Error per visible marker, negative if the solve is unusable.
    pub fn normalized_error(&self) -> f64 {
        if self.markers == 0 {
            return -1.0;
        }
        self.error / self.markers as f64
    }

    pub fn is_valid(&self) -> bool {
        self.normalized_error() >= 0.0
    }
}

/// Frame preparation before detection.
#[derive(Clone, Debug, Default)]
pub struct FramePreprocessor {
    undistort: Option<UndistortMap>,
    greyscale: bool,
    invert: bool,
}

impl FramePreprocessor {
    pub fn new(undistort: Option<UndistortMap>, greyscale: bool, invert: bool) -> Self {
        Self {
            undistort,
            greyscale,
            invert,
        }
    }

    pub fn process(&self, frame: RgbImage) -> DynamicImage {
        let frame = match &self.undistort {
            Some(map) => map.remap(&frame),
            None => frame,
        };
        let mut frame = DynamicImage::ImageRgb8(frame);
        if self.greyscale {
            frame = DynamicImage::ImageLuma8(frame.to_luma8());
        }
        if self.invert {
            frame.invert();
        }
        frame
    }

    /// Threshold to hand to the detector. Inverted frames flip the threshold too.
    pub fn detection_threshold(&self, threshold: u8) -> u8 {
        if self.invert { 255 - threshold } else { threshold }
    }
}

/// Frames written to disk by a grab script, `<command> <file>`.
pub struct CommandFrames {
    command: ShellCommand,
    path: PathBuf,
}

impl CommandFrames {
    pub fn new(command: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            command: ShellCommand::new(command),
            path: path.into(),
        }
    }
}

impl FrameSource for CommandFrames {
    fn grab(&mut self) -> Result<RgbImage, Error> {
        self.command.run(&[self.path.display()])?;
        Ok(image::open(&self.path)?.to_rgb8())
    }
}

/// What a detection script prints for a successful solve.
#[derive(Deserialize)]
struct DetectorReport {
    transform: [[f64; 4]; 3],
    error: f64,
    markers: usize,
}

/// Marker detection by an external script.
///
/// The script is called as `<command> <frame> <threshold> <board>` and prints
/// `{"transform": [[..4], [..4], [..4]], "error": e, "markers": n}` or
/// `null` if it found no marker. `<board>` is the marker layout as JSON.
pub struct CommandDetector {
    command: ShellCommand,
    frame: PathBuf,
    board: PathBuf,
    board_markers: usize,
}

impl CommandDetector {
    /// Write the board layout next to the frame file in `scratch`.
    pub fn new(
        command: impl Into<String>,
        board: &MarkerConfig,
        scratch: &Path,
    ) -> Result<Self, Error> {
        fs::create_dir_all(scratch)?;
        let board_path = scratch.join("board.json");
        fs::write(&board_path, serde_json::to_string(board)?)?;
        Ok(Self {
            command: ShellCommand::new(command),
            frame: scratch.join("detect.png"),
            board: board_path,
            board_markers: board.markers.len(),
        })
    }
}

impl MarkerDetector for CommandDetector {
    fn detect(
        &mut self,
        frame: &DynamicImage,
        threshold: u8,
    ) -> Result<Option<MarkerSolution>, Error> {
        frame.save(&self.frame)?;
        let printed = self.command.output(&[
            self.frame.display().to_string(),
            threshold.to_string(),
            self.board.display().to_string(),
        ])?;
        let report: Option<DetectorReport> = match printed.trim() {
            "" => None,
            text => serde_json::from_str(text)?,
        };
        let Some(report) = report else {
            return Ok(None);
        };
        if report.markers > self.board_markers {
            return Err(Error::Tracking(format!(
                "detector reports {} markers but the board has {}",
                report.markers, self.board_markers
            )));
        }
        Ok(Some(MarkerSolution {
            transform: Matrix3x4::from_fn(|r, c| report.transform[r][c]),
            error: report.error,
            markers: report.markers,
        }))
    }
}

/// The frame binarized the way the detector sees it.
pub fn debug_image(frame: &DynamicImage, threshold: u8) -> GrayImage {
    let mut grey = frame.to_luma8();
    grey.pixels_mut().for_each(|Luma([v])| {
        *v = if *v > threshold { 255 } else { 0 };
    });
    grey
}

/// Sweep every threshold and return the one with the lowest normalized error.
///
/// Solves with fewer than `min_markers` visible markers are ignored. Returns
/// `None` if no threshold produced a usable solve.
pub fn find_best_threshold(
    detector: &mut dyn MarkerDetector,
    frame: &DynamicImage,
    min_markers: usize,
) -> Result<Option<u8>, Error> {
    let mut best: Option<(u8, f64)> = None;
    for threshold in 0..=255u8 {
        let Some(solution) = detector.detect(frame, threshold)? else {
            continue;
        };
        if solution.markers < min_markers {
            continue;
        }
        let err = solution.normalized_error();
        if err >= 0.0 && best.is_none_or(|(_, min)| err < min) {
            debug!(threshold, err, "better threshold");
            best = Some((threshold, err));
        }
    }
    Ok(best.map(|(threshold, _)| threshold))
}

/// Newest first list of recent positions.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionHistory {
    positions: VecDeque<Vector3<f64>>,
    capacity: usize,
}

impl Default for PositionHistory {
    fn default() -> Self {
        Self::new(POSITION_HISTORY)
    }
}

impl PositionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            positions: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, position: Vector3<f64>) {
        self.positions.push_front(position);
        self.positions.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn latest(&self) -> Option<&Vector3<f64>> {
        self.positions.front()
    }

    /// True if the newest `n` positions are pairwise within `max_dist`.
    ///
    /// Always false while fewer than `n` positions are known.
    pub fn is_stable(&self, n: usize, max_dist: f64) -> bool {
        if n > self.positions.len() {
            return false;
        }
        let recent: Vec<_> = self.positions.iter().take(n).collect();
        recent
            .iter()
            .enumerate()
            .all(|(i, a)| recent[i + 1..].iter().all(|b| (*a - *b).norm() <= max_dist))
    }
}

/// Anything the illumination loop can take a display pose from.
pub trait PoseSource {
    /// True exactly once per fresh pose.
    fn has_new_data(&self) -> bool;

    /// The latest pose, read consistently.
    fn pose(&self) -> Option<Pose>;

    /// Milliseconds since the last successful detection.
    fn last_time_ms(&self) -> Option<u128>;

    fn has_stable_position(&self, n: usize, max_dist: f64) -> bool;

    /// True if poses do not come from marker detection.
    fn is_fixed(&self) -> bool {
        false
    }

    /// Binarized view of the last frame, if debug images are enabled.
    fn debug_image(&self) -> Option<GrayImage> {
        None
    }
}

/// A display that does not move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedPose {
    pose: Pose,
}

impl FixedPose {
    pub fn new(pose: Pose) -> Self {
        Self { pose }
    }
}

impl PoseSource for FixedPose {
    fn has_new_data(&self) -> bool {
        true
    }

    fn pose(&self) -> Option<Pose> {
        Some(self.pose)
    }

    fn last_time_ms(&self) -> Option<u128> {
        Some(0)
    }

    fn has_stable_position(&self, _n: usize, _max_dist: f64) -> bool {
        true
    }

    fn is_fixed(&self) -> bool {
        true
    }
}

/// Settings of the tracking thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerSettings {
    pub threshold: u8,
    pub auto_threshold: bool,
    /// Markers a threshold sweep has to see to count.
    pub min_markers: usize,
    pub debug: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            threshold: 100,
            auto_threshold: false,
            min_markers: 4,
            debug: false,
        }
    }
}

/// Everything the tracking thread publishes.
#[derive(Clone, Debug, Default)]
pub struct TrackerState {
    pub pose: Option<Pose>,
    pub history: PositionHistory,
    pub threshold: u8,
    pub last_success: Option<Instant>,
    pub debug: Option<GrayImage>,
}

/// Exclusive read access to the tracker state.
pub type TrackerGuard<'a> = MutexGuard<'a, TrackerState>;

struct Shared {
    state: Mutex<TrackerState>,
    has_new: AtomicBool,
    running: AtomicBool,
}

/// Background marker tracking.
pub struct PoseTracker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PoseTracker {
    /// Spawn the tracking thread.
    pub fn start<S, D>(
        source: S,
        detector: D,
        preprocessor: FramePreprocessor,
        settings: TrackerSettings,
    ) -> Self
    where
        S: FrameSource + 'static,
        D: MarkerDetector + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TrackerState {
                threshold: settings.threshold,
                ..Default::default()
            }),
            has_new: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || tracking_loop(&shared, source, detector, &preprocessor, settings))
        };
        info!(threshold = settings.threshold, "tracking started");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Start live tracking if the configuration names a frame grab and a
    /// detection script. `scratch` receives the files handed to them.
    ///
    /// Returns `None` for a fixed camera or when no scripts are configured.
    pub fn from_config(config: &StageConfig, scratch: &Path) -> Result<Option<Self>, Error> {
        if config.fixed_camera {
            return Ok(None);
        }
        let (Some(grab), Some(detect)) = (
            &config.tracking_frame_command,
            &config.marker_detection_command,
        ) else {
            return Ok(None);
        };
        let Some(board) = &config.marker_config else {
            return Err(Error::Tracking(
                "live tracking needs a marker configuration".into(),
            ));
        };

        let board = MarkerConfig::load(board)?;
        info!(markers = board.markers.len(), "loaded marker configuration");
        let detector = CommandDetector::new(detect.as_str(), &board, scratch)?;
        let frames = CommandFrames::new(grab.as_str(), scratch.join("frame.png"));
        Ok(Some(Self::start(
            frames,
            detector,
            config.preprocessor()?,
            config.tracker_settings(),
        )))
    }

    /// Hold the state still while reading several fields.
    pub fn read(&self) -> TrackerGuard<'_> {
        self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Ask the thread to finish and wait for it.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("tracking thread panicked");
            }
        }
    }
}

impl Drop for PoseTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PoseSource for PoseTracker {
    fn has_new_data(&self) -> bool {
        self.shared.has_new.swap(false, Ordering::AcqRel)
    }

    fn pose(&self) -> Option<Pose> {
        self.read().pose
    }

    fn last_time_ms(&self) -> Option<u128> {
        self.read().last_success.map(|t| t.elapsed().as_millis())
    }

    fn has_stable_position(&self, n: usize, max_dist: f64) -> bool {
        self.read().history.is_stable(n, max_dist)
    }

    fn debug_image(&self) -> Option<GrayImage> {
        self.read().debug.clone()
    }
}

fn tracking_loop<S: FrameSource, D: MarkerDetector>(
    shared: &Shared,
    mut source: S,
    mut detector: D,
    preprocessor: &FramePreprocessor,
    settings: TrackerSettings,
) {
    while shared.running.load(Ordering::Acquire) {
        let frame = match source.grab() {
            Ok(frame) => preprocessor.process(frame),
            Err(err) => {
                warn!(%err, "could not grab a tracking frame");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        let threshold = preprocessor.detection_threshold(shared.state.lock().threshold);
        let solution = match detector.detect(&frame, threshold) {
            Ok(solution) => solution.filter(MarkerSolution::is_valid),
            Err(err) => {
                warn!(%err, "marker detection failed");
                None
            }
        };

        let mut adopted = None;
        if solution.is_none() && settings.auto_threshold {
            match find_best_threshold(&mut detector, &frame, settings.min_markers) {
                Ok(Some(t)) => {
                    info!(threshold = t, "adopting new tracking threshold");
                    adopted = Some(t);
                }
                Ok(None) => debug!("threshold sweep found nothing"),
                Err(err) => warn!(%err, "threshold sweep failed"),
            }
        }

        let pose = solution.and_then(|s| {
            Pose::from_transform(&s.transform, s.normalized_error(), s.markers)
        });

        // Blocks while the main loop holds a guard.
        let mut state = shared.state.lock();
        if let Some(t) = adopted {
            state.threshold = t;
        }
        if settings.debug {
            state.debug = Some(debug_image(&frame, threshold));
        }
        match pose {
            Some(pose) => {
                state.history.push(pose.position);
                state.pose = Some(pose);
                state.last_success = Some(Instant::now());
                shared.has_new.store(true, Ordering::Release);
            }
            None => shared.has_new.store(false, Ordering::Release),
        }
    }
    debug!("tracking loop ended");
}
