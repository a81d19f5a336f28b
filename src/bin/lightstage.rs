use clap::{Parser, ValueEnum};
use lightstage::{
    config::{DisplayCalibration, StageConfig},
    devices::DeviceBindings,
    error::Error,
    illumination::{Display, IlluminationLoop, Key, StageMode, StageSetup},
    image::{ParallelBackend, RadianceImage},
    output::{DumpSettings, OutputLayout},
    tracking::{FixedPose, PoseSource, PoseTracker},
};
use std::{fs, path::PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Show,
    Single,
    Hold,
}

impl From<Mode> for StageMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Show => StageMode::Show,
            Mode::Single => StageMode::Single,
            Mode::Hold => StageMode::Hold,
        }
    }
}

/// Run the light stage.
///
/// The display is tracked live when the configuration names a frame grab and a
/// marker detection script, and stays at the configured fixed pose otherwise.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Light stage configuration (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Display calibration (JSON).
    #[arg(short, long)]
    display: PathBuf,

    /// Output directory.
    #[arg(short, long)]
    output: PathBuf,

    #[arg(short, long, value_enum, default_value = "single")]
    mode: Mode,

    /// Continue after this exposure index.
    #[arg(short, long)]
    resume: Option<usize>,

    /// Scale the environment into the display range (show mode).
    #[arg(long)]
    fit: bool,

    /// Where shown panel images are written. Defaults to `<output>/panel`.
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Quit after showing this many panel images.
    #[arg(long, default_value_t = 10_000)]
    max_frames: usize,
}

/// Writes every shown panel image to a directory.
struct FrameDirectory {
    dir: PathBuf,
    shown: usize,
    limit: usize,
}

impl FrameDirectory {
    fn create(dir: PathBuf, limit: usize) -> Result<Self, Error> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            shown: 0,
            limit,
        })
    }
}

impl Display for FrameDirectory {
    fn show(&mut self, frame: &RadianceImage) -> Result<(), Error> {
        frame.save_ldr(self.dir.join(format!("{:06}.png", self.shown)))?;
        self.shown += 1;
        Ok(())
    }

    fn poll_key(&mut self) -> Option<Key> {
        (self.shown >= self.limit).then_some(Key::Escape)
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = StageConfig::load(&args.config)?;
    let calibration = DisplayCalibration::load(&args.display)?;
    let devices = DeviceBindings::shell(
        &config.remote_capture_command,
        &config.backlight_control_command,
        &config.sound_notification_command,
    );
    if !matches!(args.mode, Mode::Show) {
        devices.camera.setup()?;
    }

    let env_map = RadianceImage::load(&config.env_map)?;
    let setup = StageSetup::prepare(&config, &calibration, env_map, ParallelBackend)?;

    let dumps = DumpSettings {
        screen: config.dump_screen,
        hdr_frames: config.dump_hdr_frames,
        tracking_image: config.dump_tracking_image,
        tracking_log: config.dump_tracking_log,
        remaining: config.dump_env_map_remaining,
        used: config.dump_env_map_used,
        completed: config.dump_env_map_completed,
    };
    let output = OutputLayout::create(&args.output, dumps)?;
    let display = FrameDirectory::create(
        args.frames.unwrap_or_else(|| args.output.join("panel")),
        args.max_frames,
    )?;
    let stage = Stage {
        setup,
        devices,
        display,
        output,
        resume: args.resume,
        fit: args.fit,
        mode: args.mode.into(),
    };
    match PoseTracker::from_config(&config, &args.output.join("tracking"))? {
        Some(tracker) => stage.run(tracker, config),
        None => {
            info!("no live tracking configured, using the fixed pose");
            let poses = FixedPose::new(config.fixed_pose());
            stage.run(poses, config)
        }
    }
}

/// Everything the loop needs apart from its pose source.
struct Stage {
    setup: StageSetup<ParallelBackend>,
    devices: DeviceBindings,
    display: FrameDirectory,
    output: OutputLayout,
    resume: Option<usize>,
    fit: bool,
    mode: StageMode,
}

impl Stage {
    fn run<P: PoseSource>(self, poses: P, config: StageConfig) -> Result<(), Error> {
        let mut stage =
            IlluminationLoop::new(self.setup, self.devices, poses, self.display, self.output, config);
        if let Some(index) = self.resume {
            stage.resume(index)?;
        }
        if self.fit {
            stage.fit_to_display_range()?;
        }

        let summary = stage.run(self.mode)?;
        info!(
            committed = summary.committed,
            failed = summary.failed,
            complete = summary.complete,
            "done"
        );
        Ok(())
    }
}
