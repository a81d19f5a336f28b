//! Remote camera, backlight and sound cues.
//!
//! Every device action blocks until the device is done and reports failure as
//! [`Error::Device`]. [`ShellCommand`] drives all three through user supplied
//! scripts:
//!
//! ```text
//! <camera> setup
//! <camera> capture <exposure> <aperture> <file>
//! <backlight> <percent>
//! <sound> <cue number>
//! ```

use crate::error::Error;
use std::{
    fmt::Display,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
};
use tracing::{debug, info, warn};

/// Audible operator cues. The discriminant is the number passed to the sound script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cue {
    Error,
    Warning,
    Start,
    Search,
    CaptureStart,
    CaptureEnd,
    Finish,
    Closer,
    Away,
    Angle,
    ProcessingStart,
    ProcessingEnd,
    Position,
    Overlap,
    More,
    Less,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Left,
    Right,
    Top,
}

impl Cue {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Spoken tilt for a steep incidence angle in degrees.
    ///
    /// Angles below 2 degrees say "one", below 3 "two" and so on up to "ten".
    /// Anything steeper asks for a new position.
    pub fn for_angle(degrees: f64) -> Self {
        const SPOKEN: [Cue; 10] = [
            Cue::One,
            Cue::Two,
            Cue::Three,
            Cue::Four,
            Cue::Five,
            Cue::Six,
            Cue::Seven,
            Cue::Eight,
            Cue::Nine,
            Cue::Ten,
        ];
        SPOKEN
            .iter()
            .enumerate()
            .find(|(i, _)| degrees < (*i + 2) as f64)
            .map_or(Cue::Position, |(_, cue)| *cue)
    }
}

/// One exposure of the remote camera.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequest {
    pub path: PathBuf,
    /// Shutter time in seconds.
    pub exposure: f64,
    pub aperture: f64,
}

impl CaptureRequest {
    pub fn new(path: impl Into<PathBuf>, exposure: f64, aperture: f64) -> Self {
        Self {
            path: path.into(),
            exposure,
            aperture,
        }
    }
}

pub trait CameraTrigger: Send + Sync {
    fn setup(&self) -> Result<(), Error>;

    /// Expose and store the image at `request.path`.
    fn capture(&self, request: &CaptureRequest) -> Result<(), Error>;
}

pub trait Backlight: Send + Sync {
    /// Set the backlight to `level` in `[0, 1]`.
    fn set_backlight(&self, level: f64) -> Result<(), Error>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, cue: Cue) -> Result<(), Error>;
}

/// A device driven by a shell script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    command: String,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Run `sh -c "<command> <args>"` and wait for it.
    pub fn run<A: Display>(&self, args: &[A]) -> Result<(), Error> {
        self.output(args).map(|_| ())
    }

    /// Like [`ShellCommand::run`], returning what the command printed.
    pub fn output<A: Display>(&self, args: &[A]) -> Result<String, Error> {
        let line = args
            .iter()
            .fold(self.command.clone(), |line, arg| format!("{line} {arg}"));
        debug!(%line, "running device command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .stderr(Stdio::inherit())
            .output()
            .map_err(|err| Error::Device {
                command: line.clone(),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Device {
                command: line,
                reason: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl CameraTrigger for ShellCommand {
    fn setup(&self) -> Result<(), Error> {
        info!("initializing remote camera");
        self.run(&["setup"])
    }

    fn capture(&self, request: &CaptureRequest) -> Result<(), Error> {
        info!(
            exposure = request.exposure,
            aperture = request.aperture,
            path = %request.path.display(),
            "remote capture"
        );
        self.run(&[
            "capture".to_string(),
            request.exposure.to_string(),
            request.aperture.to_string(),
            request.path.display().to_string(),
        ])
    }
}

impl Backlight for ShellCommand {
    fn set_backlight(&self, level: f64) -> Result<(), Error> {
        self.run(&[(100.0 * level + 0.5) as i32])
    }
}

impl Notifier for ShellCommand {
    fn notify(&self, cue: Cue) -> Result<(), Error> {
        self.run(&[cue.code()])
    }
}

/// Stand-in for absent hardware. Every action succeeds immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NullDevice;

impl CameraTrigger for NullDevice {
    fn setup(&self) -> Result<(), Error> {
        Ok(())
    }

    fn capture(&self, _request: &CaptureRequest) -> Result<(), Error> {
        Ok(())
    }
}

impl Backlight for NullDevice {
    fn set_backlight(&self, _level: f64) -> Result<(), Error> {
        Ok(())
    }
}

impl Notifier for NullDevice {
    fn notify(&self, _cue: Cue) -> Result<(), Error> {
        Ok(())
    }
}

/// The devices the illumination loop talks to.
#[derive(Clone)]
pub struct DeviceBindings {
    pub camera: Arc<dyn CameraTrigger>,
    pub backlight: Arc<dyn Backlight>,
    pub notifier: Arc<dyn Notifier>,
}

impl DeviceBindings {
    pub fn new(
        camera: Arc<dyn CameraTrigger>,
        backlight: Arc<dyn Backlight>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            camera,
            backlight,
            notifier,
        }
    }

    /// Shell scripts for all three devices.
    pub fn shell(camera: &str, backlight: &str, sound: &str) -> Self {
        Self::new(
            Arc::new(ShellCommand::new(camera)),
            Arc::new(ShellCommand::new(backlight)),
            Arc::new(ShellCommand::new(sound)),
        )
    }

    pub fn null() -> Self {
        Self::new(Arc::new(NullDevice), Arc::new(NullDevice), Arc::new(NullDevice))
    }

    /// Play a cue. A failing sound is logged and otherwise ignored.
    pub fn cue(&self, cue: Cue) {
        if let Err(err) = self.notifier.notify(cue) {
            warn!(%err, ?cue, "could not play cue");
        }
    }

    pub fn capture_controller(&self) -> CaptureController {
        CaptureController::new(Arc::clone(&self.camera))
    }
}

/// Runs exposures on their own thread so the display loop keeps its timing.
#[derive(Clone)]
pub struct CaptureController {
    camera: Arc<dyn CameraTrigger>,
}

impl CaptureController {
    pub fn new(camera: Arc<dyn CameraTrigger>) -> Self {
        Self { camera }
    }

    pub fn start(&self, request: CaptureRequest) -> CaptureHandle {
        let (tx, rx) = mpsc::channel();
        let camera = Arc::clone(&self.camera);
        let handle = thread::spawn(move || {
            let result = camera.capture(&request);
            // The receiver may already be gone if the handle was dropped.
            let _ = tx.send(result);
        });
        CaptureHandle {
            rx,
            handle: Some(handle),
        }
    }
}

/// An exposure in flight.
pub struct CaptureHandle {
    rx: mpsc::Receiver<Result<(), Error>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block until the exposure is done and return the device result.
    pub fn wait(mut self) -> Result<(), Error> {
        let result = self.rx.recv().map_err(|_| Error::Device {
            command: "capture".into(),
            reason: "capture thread ended without a result".into(),
        });
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked");
            }
        }
        result?
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
