//! Files written during a run.
//!
//! ```text
//! <out>/result/            captured exposures and dark frames
//! <out>/envmap_remaining/  cube maps per committed exposure
//! <out>/envmap_used/
//! <out>/envmap_completed/  read back to resume a run
//! <out>/screen/            required radiance and HDR frames
//! <out>/tracking/          binarized tracking frames
//! <out>/exposures.log      "<index> <scale>" per committed exposure
//! <out>/tracking.log       pose diagnostics
//! ```

use crate::{
    cube::{CubeMap, cart_to_spherical},
    error::Error,
    image::RadianceImage,
    screen::ScreenPose,
};
use image::GrayImage;
use nalgebra::Vector3;
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Which intermediate results get written after a commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpSettings {
    pub screen: bool,
    pub hdr_frames: bool,
    pub tracking_image: bool,
    pub tracking_log: bool,
    pub remaining: bool,
    pub used: bool,
    pub completed: bool,
}

/// One line of `tracking.log`.
///
/// Lines written while a sequence is displayed carry the frame number and the
/// anti-shake shift. The line written on commit has neither.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackingLogEntry {
    pub index: usize,
    pub frame: Option<(usize, (i64, i64))>,
    pub error: f64,
    pub markers: usize,
    /// Board position relative to the stage origin.
    pub position: Vector3<f64>,
    pub screen: ScreenPose,
    /// Steepest light angle in degrees.
    pub angle: f64,
}

impl fmt::Display for TrackingLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = |v: &Vector3<f64>| format!("{} {} {}", v.x, v.y, v.z);
        write!(f, "{} ", self.index)?;
        if let Some((frame, (x, y))) = self.frame {
            write!(f, "Frame {frame} shift ( {x} {y} ) ")?;
        }
        write!(
            f,
            "err = {} m = {} pos_pher ( {} ) pos_cart ( {} ) fw ( {} ) down ( {} ) right ( {} ) angle = {} ",
            self.error,
            self.markers,
            v(&cart_to_spherical(&self.position)),
            v(&self.position),
            v(&self.screen.center),
            v(&self.screen.down),
            v(&self.screen.right),
            self.angle,
        )
    }
}

/// The output directory of a run.
#[derive(Debug)]
pub struct OutputLayout {
    root: PathBuf,
    dumps: DumpSettings,
    exposures: File,
    tracking: Option<File>,
}

impl OutputLayout {
    const DIRS: [&'static str; 6] = [
        "result",
        "envmap_remaining",
        "envmap_used",
        "envmap_completed",
        "screen",
        "tracking",
    ];

    /// Create the directory tree under `root` and open the logs for appending.
    pub fn create<P: AsRef<Path>>(root: P, dumps: DumpSettings) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        for dir in Self::DIRS {
            fs::create_dir_all(root.join(dir))?;
        }
        let append = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(root.join(name))
        };
        let exposures = append("exposures.log")?;
        let tracking = if dumps.tracking_log {
            Some(append("tracking.log")?)
        } else {
            None
        };
        debug!(root = %root.display(), "output directories ready");

        Ok(Self {
            root,
            dumps,
            exposures,
            tracking,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dumps(&self) -> &DumpSettings {
        &self.dumps
    }

    /// Path the camera stores exposure `index` at. The extension is left to the camera.
    pub fn capture_path(&self, index: usize) -> PathBuf {
        self.root.join("result").join(index.to_string())
    }

    pub fn dark_frame_path(&self, index: usize) -> PathBuf {
        self.root.join("result").join(format!("{index}_df"))
    }

    fn cube_path(&self, kind: &str, index: usize) -> PathBuf {
        self.root.join(kind).join(format!("{index}.exr"))
    }

    pub fn log_exposure(&mut self, index: usize, scale: f64) -> Result<(), Error> {
        writeln!(self.exposures, "{index} {scale}")?;
        Ok(())
    }

    pub fn log_tracking(&mut self, entry: &TrackingLogEntry) -> Result<(), Error> {
        if let Some(log) = self.tracking.as_mut() {
            writeln!(log, "{entry}")?;
        }
        Ok(())
    }

    /// Write the results of a committed exposure as selected by the dump settings.
    pub fn dump_commit(&self, index: usize, commit: &CommitDump<'_>) -> Result<(), Error> {
        if self.dumps.screen {
            commit
                .required
                .save_exr(self.root.join("screen").join(format!("{index}.exr")))?;
        }
        if self.dumps.hdr_frames {
            for (i, frame) in commit.frames.iter().enumerate() {
                frame.save_ldr(self.root.join("screen").join(format!("frame_{i}.bmp")))?;
            }
        }
        if self.dumps.tracking_image {
            if let Some(img) = commit.tracking {
                img.save(self.root.join("tracking").join(format!("{index}.jpg")))?;
            }
        }
        for (enabled, kind, map) in [
            (self.dumps.remaining, "envmap_remaining", commit.remaining),
            (self.dumps.used, "envmap_used", commit.used),
            (self.dumps.completed, "envmap_completed", commit.completed),
        ] {
            if enabled {
                map.image().save_exr(self.cube_path(kind, index))?;
            }
        }
        Ok(())
    }

    /// The completed map dumped after exposure `index`.
    ///
    /// A missing or unreadable dump is reported and yields `None`, so the run
    /// starts over.
    pub fn load_completed(&self, index: usize) -> Option<CubeMap> {
        let path = self.cube_path("envmap_completed", index);
        match RadianceImage::load(&path).and_then(CubeMap::from_strip) {
            Ok(map) => Some(map),
            Err(err) => {
                warn!(%err, path = %path.display(), "cannot resume, starting fresh");
                None
            }
        }
    }
}

/// Everything [`OutputLayout::dump_commit`] may write.
pub struct CommitDump<'a> {
    pub required: &'a RadianceImage,
    pub frames: &'a [RadianceImage],
    pub tracking: Option<&'a GrayImage>,
    pub remaining: &'a CubeMap,
    pub used: &'a CubeMap,
    pub completed: &'a CubeMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(frame: Option<(usize, (i64, i64))>) -> TrackingLogEntry {
        TrackingLogEntry {
            index: 7,
            frame,
            error: 0.5,
            markers: 4,
            position: Vector3::new(0.0, 0.0, 2.0),
            screen: ScreenPose::new(
                Vector3::new(0.0, 0.0, 1000.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, -1.0, 0.0),
            ),
            angle: 1.5,
        }
    }

    #[test]
    fn tracking_line_while_displaying() {
        insta::assert_snapshot!(
            entry(Some((2, (3, -1)))).to_string(),
            @"7 Frame 2 shift ( 3 -1 ) err = 0.5 m = 4 pos_pher ( 2 0 0 ) pos_cart ( 0 0 2 ) fw ( 0 0 1000 ) down ( 1 0 0 ) right ( 0 -1 0 ) angle = 1.5 "
        );
    }

    #[test]
    fn tracking_line_on_commit() {
        insta::assert_snapshot!(
            entry(None).to_string(),
            @"7 err = 0.5 m = 4 pos_pher ( 2 0 0 ) pos_cart ( 0 0 2 ) fw ( 0 0 1000 ) down ( 1 0 0 ) right ( 0 -1 0 ) angle = 1.5 "
        );
    }

    #[test]
    fn creates_tree_and_appends_logs() {
        let dir = tempfile::tempdir().unwrap();
        let dumps = DumpSettings {
            tracking_log: true,
            ..Default::default()
        };
        {
            let mut out = OutputLayout::create(dir.path(), dumps).unwrap();
            out.log_exposure(0, 1.25).unwrap();
            out.log_tracking(&entry(None)).unwrap();
        }
        let mut out = OutputLayout::create(dir.path(), dumps).unwrap();
        out.log_exposure(1, 2.0).unwrap();

        for sub in OutputLayout::DIRS {
            assert!(dir.path().join(sub).is_dir());
        }
        let exposures = fs::read_to_string(dir.path().join("exposures.log")).unwrap();
        assert_eq!(exposures, "0 1.25\n1 2\n");
        let tracking = fs::read_to_string(dir.path().join("tracking.log")).unwrap();
        assert!(tracking.starts_with("7 err = 0.5"));
        assert_eq!(out.capture_path(3), dir.path().join("result").join("3"));
        assert_eq!(out.dark_frame_path(3), dir.path().join("result").join("3_df"));
    }

    #[test]
    fn resume_without_dump_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputLayout::create(dir.path(), DumpSettings::default()).unwrap();
        assert!(out.load_completed(4).is_none());
    }

    #[test]
    fn completed_dump_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dumps = DumpSettings {
            completed: true,
            ..Default::default()
        };
        let out = OutputLayout::create(dir.path(), dumps).unwrap();

        let mut completed = CubeMap::new(2);
        completed.image_mut().fill([0.25, 0.5, 1.0]);
        let empty = CubeMap::new(2);
        let required = RadianceImage::new(1, 1);
        out.dump_commit(
            5,
            &CommitDump {
                required: &required,
                frames: &[],
                tracking: None,
                remaining: &empty,
                used: &empty,
                completed: &completed,
            },
        )
        .unwrap();

        assert!(!dir.path().join("envmap_used").join("5.exr").exists());
        let loaded = out.load_completed(5).unwrap();
        assert_eq!(loaded.size(), 2);
        assert_eq!(loaded.image().get(11, 1), Some(&[0.25, 0.5, 1.0]));
    }
}
