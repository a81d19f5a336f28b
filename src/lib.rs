// #![warn(missing_docs)]

//! Light Stage Utilities
//!
//! Reproduces a high dynamic range environment map with a tracked, hand-held
//! display. The remaining light of the environment is kept on a cube map,
//! projected onto the display for its current pose and split into a short
//! sequence of low dynamic range frames that a long camera exposure sums up.

#[allow(missing_docs)]
pub mod error;

pub mod camera;
pub mod config;
pub mod cube;
pub mod devices;
pub mod environment;
pub mod homography;
pub mod illumination;
pub mod image;
pub mod output;
pub mod projector;
pub mod screen;
pub mod sequencer;
pub mod state;
pub mod svr;
pub mod tracking;

pub mod prelude {
    pub use crate::{
        config::{DisplayCalibration, MarkerConfig, StageConfig},
        cube::{CubeMap, Face},
        devices::{Cue, DeviceBindings},
        environment::CubeEnvironment,
        error::Error,
        illumination::{Display, IlluminationLoop, Key, StageMode, StageSetup},
        image::{ImageBackend, ParallelBackend, RadianceImage, SequentialBackend},
        output::{DumpSettings, OutputLayout},
        screen::{ScreenGeometry, ScreenPose},
        sequencer::HdrSequencer,
        state::Pose,
        svr::SvrInfo,
        tracking::{FixedPose, PoseSource, PoseTracker},
    };
}
