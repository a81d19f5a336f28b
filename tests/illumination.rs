use approx::assert_relative_eq;
use lightstage::{
    config::{DisplayCalibration, StageConfig},
    cube::Face,
    devices::{Backlight, CameraTrigger, CaptureRequest, Cue, DeviceBindings, Notifier},
    error::Error,
    illumination::{
        CycleFailure, Display, IlluminationLoop, Key, Rejection, StageMode, StageSetup, Step,
    },
    image::{RadianceImage, SequentialBackend},
    output::{DumpSettings, OutputLayout},
    state::Pose,
    svr::Patch,
    tracking::{FixedPose, PoseSource},
};
use nalgebra::{Matrix3, Vector3};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

#[derive(Default)]
struct Devices {
    captures: Mutex<Vec<PathBuf>>,
    cues: Mutex<Vec<Cue>>,
    /// How long the end of capture sound plays.
    capture_end_sound: Duration,
}

impl CameraTrigger for Devices {
    fn setup(&self) -> Result<(), Error> {
        Ok(())
    }

    fn capture(&self, request: &CaptureRequest) -> Result<(), Error> {
        self.captures.lock().push(request.path.clone());
        Ok(())
    }
}

impl Backlight for Devices {
    fn set_backlight(&self, _level: f64) -> Result<(), Error> {
        Ok(())
    }
}

impl Notifier for Devices {
    fn notify(&self, cue: Cue) -> Result<(), Error> {
        self.cues.lock().push(cue);
        if cue == Cue::CaptureEnd {
            thread::sleep(self.capture_end_sound);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Screen {
    shown: Vec<RadianceImage>,
    keys: VecDeque<Option<Key>>,
    /// Time every frame takes to reach the panel.
    latency: Duration,
}

impl Display for Screen {
    fn show(&mut self, frame: &RadianceImage) -> Result<(), Error> {
        thread::sleep(self.latency);
        self.shown.push(frame.clone());
        Ok(())
    }

    fn poll_key(&mut self) -> Option<Key> {
        self.keys.pop_front().flatten()
    }
}

fn calibration() -> DisplayCalibration {
    DisplayCalibration {
        exposure_time: 1.0,
        aperture: 8.0,
        screen_size: [8.0, 8.0],
        screen_size_mm: [40.0, 40.0],
        border_size: [0.0, 0.0],
        screen_position: [0.0; 3],
        color_transform: None,
        patch_layout: [1, 1],
        patch_size: 8.0,
        patches: vec![Patch {
            min: [0.0; 3],
            max: [1.0; 3],
            response: (0..=100).map(|i| [i as f32 / 100.0; 3]).collect(),
        }],
    }
}

fn config() -> StageConfig {
    StageConfig {
        stage_radius: 100.0,
        stage_radius_tolerance: 10.0,
        stage_angle_tolerance: 5.0,
        hdr_sequence_size: 1,
        hdr_sequence_fps: 20.0,
        timing_tolerance: 0.5,
        capture_wait: 0.0,
        cooldown_ms: 0,
        failure_cooldown_ms: 0,
        idle_interval_ms: 0,
        dump_env_map_completed: true,
        dump_tracking_log: true,
        ..Default::default()
    }
}

/// Board pose that puts the screen 100 mm along +x, facing the origin.
fn facing_right() -> Pose {
    let rotation = Matrix3::from_columns(&[
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(0.0, 0.0, -1.0),
        Vector3::new(-1.0, 0.0, 0.0),
    ]);
    Pose::fixed(rotation, Vector3::new(100.0, 0.0, 0.0))
}

/// Hands out `poses` one per read, then keeps repeating the last one.
struct Replay {
    poses: Mutex<VecDeque<Pose>>,
    last: Pose,
}

impl Replay {
    fn new(poses: Vec<Pose>) -> Self {
        let last = poses[poses.len() - 1];
        Self {
            poses: Mutex::new(poses.into()),
            last,
        }
    }
}

impl PoseSource for Replay {
    fn has_new_data(&self) -> bool {
        true
    }

    fn pose(&self) -> Option<Pose> {
        Some(self.poses.lock().pop_front().unwrap_or(self.last))
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

fn uniform_setup(config: &StageConfig) -> StageSetup<SequentialBackend> {
    let env_map = RadianceImage::filled(96, 16, [0.5; 3]);
    StageSetup::prepare(config, &calibration(), env_map, SequentialBackend).unwrap()
}

#[test]
fn single_exposure_consumes_visible_face() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let devices = Arc::new(Devices::default());
    let bindings = DeviceBindings::new(devices.clone(), devices.clone(), devices.clone());
    let output = OutputLayout::create(
        dir.path(),
        DumpSettings {
            completed: true,
            tracking_log: true,
            ..Default::default()
        },
    )
    .unwrap();

    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        bindings,
        FixedPose::new(facing_right()),
        Screen::default(),
        output,
        config,
    );
    let summary = stage.run(StageMode::Single).unwrap();

    assert_eq!(summary.committed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(stage.exposure_index(), 1);

    let env = stage.environment();
    let completed = env.completed().face(Face::Right);
    let remaining = env.remaining().face(Face::Right);
    assert_relative_eq!(completed.get(8, 8).unwrap()[1], 1.0, epsilon = 1e-4);
    assert_relative_eq!(remaining.get(8, 8).unwrap()[1], 0.0, epsilon = 1e-4);
    for face in [Face::Left, Face::Back, Face::Front, Face::Top, Face::Bottom] {
        assert_eq!(env.remaining().face(face), env.original().face(face));
    }

    // Black, the single frame, black again.
    let shown = &stage.display().shown;
    assert_eq!(shown.len(), 3);
    assert_relative_eq!(shown[0].max_value(), 0.0);
    assert_relative_eq!(shown[1].get(4, 4).unwrap()[0], 1.0);
    assert_relative_eq!(shown[2].max_value(), 0.0);

    assert_eq!(*devices.captures.lock(), vec![dir.path().join("result").join("0")]);
    let cues = devices.cues.lock();
    assert_eq!(cues.first(), Some(&Cue::Start));
    assert!(cues.contains(&Cue::ProcessingEnd));
    assert!(!cues.contains(&Cue::Error));

    let exposures = fs::read_to_string(dir.path().join("exposures.log")).unwrap();
    let columns: Vec<&str> = exposures.split_whitespace().collect();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0], "0");
    assert_relative_eq!(columns[1].parse::<f64>().unwrap(), 2.0, epsilon = 1e-5);
    let tracking = fs::read_to_string(dir.path().join("tracking.log")).unwrap();
    assert_eq!(tracking.lines().count(), 2);
    assert!(tracking.starts_with("0 Frame 0 shift ( 0 0 )"));
    assert!(dir.path().join("envmap_completed").join("0.exr").is_file());
}

#[test]
fn resumed_run_continues_after_dump() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let dumps = DumpSettings {
        completed: true,
        ..Default::default()
    };

    let mut first = IlluminationLoop::new(
        uniform_setup(&config),
        DeviceBindings::null(),
        FixedPose::new(facing_right()),
        Screen::default(),
        OutputLayout::create(dir.path(), dumps).unwrap(),
        config.clone(),
    );
    first.run(StageMode::Single).unwrap();

    let mut second = IlluminationLoop::new(
        uniform_setup(&config),
        DeviceBindings::null(),
        FixedPose::new(facing_right()),
        Screen::default(),
        OutputLayout::create(dir.path(), dumps).unwrap(),
        config,
    );
    assert!(!second.resume(3).unwrap());
    assert!(second.resume(0).unwrap());
    assert_eq!(second.exposure_index(), 1);

    let restored = second.environment().completed().face(Face::Right);
    let reference = first.environment().completed().face(Face::Right);
    assert_relative_eq!(
        restored.get(8, 8).unwrap()[0],
        reference.get(8, 8).unwrap()[0],
        epsilon = 1e-6
    );
}

#[test]
fn position_out_of_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StageConfig {
        stage_radius: 300.0,
        ..config()
    };
    let devices = Arc::new(Devices::default());
    let bindings = DeviceBindings::new(devices.clone(), devices.clone(), devices.clone());

    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        bindings,
        FixedPose::new(facing_right()),
        Screen::default(),
        OutputLayout::create(dir.path(), DumpSettings::default()).unwrap(),
        config,
    );

    let step = stage.step(StageMode::Hold).unwrap();
    assert!(matches!(
        step,
        Step::Rejected(Rejection::TooClose(_))
    ));
    assert_eq!(*devices.cues.lock(), vec![Cue::Away]);
    assert!(devices.captures.lock().is_empty());
    assert_eq!(stage.environment().remaining(), stage.environment().original());
}

#[test]
fn escape_aborts_without_commit() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let screen = Screen {
        keys: VecDeque::from([None, Some(Key::Escape)]),
        ..Default::default()
    };

    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        DeviceBindings::null(),
        FixedPose::new(facing_right()),
        screen,
        OutputLayout::create(dir.path(), DumpSettings::default()).unwrap(),
        config,
    );

    let step = stage.step(StageMode::Hold).unwrap();
    assert!(matches!(
        step,
        Step::Failed(CycleFailure::Aborted)
    ));
    assert_eq!(stage.exposure_index(), 0);
    assert_eq!(stage.environment().remaining(), stage.environment().original());
    assert!(stage.environment().completed().image().is_below(1e-9));
}

#[test]
fn show_mode_displays_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        DeviceBindings::null(),
        FixedPose::new(facing_right()),
        Screen::default(),
        OutputLayout::create(dir.path(), DumpSettings::default()).unwrap(),
        config,
    );

    assert!(matches!(
        stage.step(StageMode::Show).unwrap(),
        Step::Shown
    ));
    let shown = &stage.display().shown;
    assert_eq!(shown.len(), 1);
    assert_relative_eq!(shown[0].get(4, 4).unwrap()[2], 0.5, epsilon = 0.01);
}

#[test]
fn capture_end_sound_is_outside_the_display_budget() {
    let dir = tempfile::tempdir().unwrap();
    let config = StageConfig {
        hdr_sequence_fps: 5.0,
        timing_tolerance: 0.05,
        ..config()
    };
    let devices = Arc::new(Devices {
        capture_end_sound: Duration::from_millis(300),
        ..Default::default()
    });
    let bindings = DeviceBindings::new(devices.clone(), devices.clone(), devices.clone());

    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        bindings,
        FixedPose::new(facing_right()),
        Screen::default(),
        OutputLayout::create(dir.path(), DumpSettings::default()).unwrap(),
        config,
    );

    let step = stage.step(StageMode::Single).unwrap();
    assert!(matches!(step, Step::Committed { index: 0, .. }), "{step:?}");
    assert!(devices.cues.lock().contains(&Cue::CaptureEnd));
    assert_eq!(stage.exposure_index(), 1);
}

#[test]
fn slow_display_fails_the_timing_check() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let screen = Screen {
        latency: Duration::from_millis(150),
        ..Default::default()
    };

    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        DeviceBindings::null(),
        FixedPose::new(facing_right()),
        screen,
        OutputLayout::create(dir.path(), DumpSettings::default()).unwrap(),
        config,
    );

    let step = stage.step(StageMode::Hold).unwrap();
    let Step::Failed(CycleFailure::Timing {
        elapsed_ms,
        budget_ms,
    }) = step
    else {
        panic!("expected a timing failure, got {step:?}");
    };
    assert_relative_eq!(budget_ms, 50.0, epsilon = 1e-9);
    assert!(elapsed_ms >= 150.0);
    assert_eq!(stage.exposure_index(), 0);
    assert_eq!(stage.environment().remaining(), stage.environment().original());
    assert_eq!(fs::read_to_string(dir.path().join("exposures.log")).unwrap(), "");
}

#[test]
fn drifting_display_fails_the_exposure() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let moved = Pose {
        position: Vector3::new(100.0, 25.0, 0.0),
        ..facing_right()
    };

    let mut stage = IlluminationLoop::new(
        uniform_setup(&config),
        DeviceBindings::null(),
        Replay::new(vec![facing_right(), moved]),
        Screen::default(),
        OutputLayout::create(dir.path(), DumpSettings::default()).unwrap(),
        config,
    );

    let step = stage.step(StageMode::Hold).unwrap();
    let Step::Failed(CycleFailure::Drift(drift)) = step else {
        panic!("expected a drift failure, got {step:?}");
    };
    assert_relative_eq!(drift, 25.0, epsilon = 1e-6);
    assert_eq!(stage.exposure_index(), 0);
    assert_eq!(stage.environment().remaining(), stage.environment().original());
    assert!(stage.environment().completed().image().is_below(1e-9));
}
