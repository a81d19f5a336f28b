//! Light energy bookkeeping on the cube map.
//!
//! Three maps are tracked next to the immutable `original`:
//!
//! ```text
//! remaining = original - original * completed
//! used      = footprint of the screen in the current cycle
//! completed = min(completed + used, 1)        (after a commit)
//! ```

use crate::{
    cube::CubeMap,
    error::Error,
    image::{ImageBackend, ParallelBackend, RadianceImage},
    projector::Projector,
    screen::{ScreenGeometry, ScreenPose},
    sequencer::{HdrSequence, HdrSequencer},
    svr::{Bound, SvrInfo},
};
use tracing::{debug, info};
use uom::si::f64::Angle;

/// Threshold below which remaining light counts as displayed.
pub const COMPLETION_EPSILON: f32 = 1e-5;

/// The environment to reproduce and the display that reproduces it.
#[derive(Clone, Debug)]
pub struct CubeEnvironment<B: ImageBackend = ParallelBackend> {
    backend: B,
    projector: Projector,
    svr: SvrInfo,
    original: CubeMap,
    remaining: CubeMap,
    used: CubeMap,
    completed: CubeMap,
    min_light: RadianceImage,
    max_light: RadianceImage,
    ceiling: RadianceImage,
    border_mask: RadianceImage,
    required: RadianceImage,
    cos_factor: bool,
}

impl<B: ImageBackend> CubeEnvironment<B> {
    /// Set up the bookkeeping for `original` shown on a screen of `geometry`.
    ///
    /// The display bounds are sampled from `svr` on the screen pixel grid, so the
    /// model must already be scaled to that resolution.
    pub fn new(
        original: CubeMap,
        svr: SvrInfo,
        geometry: ScreenGeometry,
        border_ramp: (usize, usize),
        backend: B,
    ) -> Result<Self, Error> {
        let (width, height) = geometry.pixels();
        let (usable_w, usable_h) = svr.usable_size();
        if (usable_w - width as f64).abs() > 1.0 || (usable_h - height as f64).abs() > 1.0 {
            return Err(Error::Calibration(format!(
                "display model covers {usable_w}x{usable_h} pixels but the screen has {width}x{height}"
            )));
        }

        let size = original.size();
        info!(size, width, height, "building cube environment");

        let min_light = svr.get_min_max_screen(width, height, Bound::Min);
        let max_light = svr.get_min_max_screen(width, height, Bound::Max);
        let mut ceiling = max_light.clone();
        backend.subtract(&mut ceiling, &min_light)?;

        Ok(Self {
            backend,
            projector: Projector::new(geometry, size),
            svr,
            remaining: original.clone(),
            used: CubeMap::new(size),
            completed: CubeMap::new(size),
            original,
            min_light,
            max_light,
            ceiling,
            border_mask: geometry.border_ramp_mask(border_ramp),
            required: RadianceImage::new(width, height),
            cos_factor: false,
        })
    }

    /// Compensate the required radiance for oblique emission.
    pub fn with_cos_factor(mut self, enabled: bool) -> Self {
        self.cos_factor = enabled;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn geometry(&self) -> &ScreenGeometry {
        self.projector.geometry()
    }

    pub fn svr(&self) -> &SvrInfo {
        &self.svr
    }

    pub fn original(&self) -> &CubeMap {
        &self.original
    }

    pub fn remaining(&self) -> &CubeMap {
        &self.remaining
    }

    pub fn used(&self) -> &CubeMap {
        &self.used
    }

    pub fn completed(&self) -> &CubeMap {
        &self.completed
    }

    /// Darkest radiance per screen pixel.
    pub fn min_light(&self) -> &RadianceImage {
        &self.min_light
    }

    /// Brightest radiance per screen pixel.
    pub fn max_light(&self) -> &RadianceImage {
        &self.max_light
    }

    /// Radiance one frame can add per screen pixel.
    pub fn ceiling(&self) -> &RadianceImage {
        &self.ceiling
    }

    pub fn border_mask(&self) -> &RadianceImage {
        &self.border_mask
    }

    /// Required radiance of the last [`CubeEnvironment::calc_hdr_frames`] call, before scaling.
    pub fn required(&self) -> &RadianceImage {
        &self.required
    }

    pub fn max_angle(&self, pose: &ScreenPose) -> Angle {
        pose.max_angle()
    }

    /// Compute the frames that display the remaining light seen through `pose`.
    ///
    /// Also records the screen footprint in `used`, ready for
    /// [`CubeEnvironment::commit`].
    pub fn calc_hdr_frames(
        &mut self,
        pose: &ScreenPose,
        sequencer: &HdrSequencer,
    ) -> Result<HdrSequence, Error> {
        let faces = self.projector.sides_to_project(pose);
        debug!(?faces, "projecting remaining light");

        let mut required = RadianceImage::new(self.geometry().width(), self.geometry().height());
        self.projector.project_forward(
            &self.backend,
            &mut required,
            &self.remaining,
            pose,
            Some(&faces),
        )?;
        self.backend.multiply(&mut required, &self.border_mask)?;

        self.used = CubeMap::new(self.original.size());
        self.projector
            .project_backward(&self.backend, &mut self.used, &self.border_mask, pose)?;

        if self.cos_factor {
            let cosines = self.projector.geometry().cosine_map(pose);
            let width = required.width().max(1);
            self.backend.for_each_pixel(&mut required, &|x, y, px| {
                let cos = cosines[y * width + x];
                if cos > 0.0 {
                    px.iter_mut().for_each(|v| *v /= cos as f32);
                }
            });
        }

        let sequence = sequencer.decompose(&required, &self.min_light, &self.ceiling, &self.svr)?;
        self.required = required;
        Ok(sequence)
    }

    /// Mark the light of the last computed sequence as displayed.
    pub fn commit(&mut self) -> Result<(), Error> {
        self.backend
            .add(self.completed.image_mut(), self.used.image())?;
        self.backend.min_scalar(self.completed.image_mut(), 1.0);
        self.update_remaining()
    }

    /// Restore the state of an earlier run from its `completed` map.
    pub fn resume(&mut self, completed: CubeMap) -> Result<(), Error> {
        if completed.image().dimensions() != self.original.image().dimensions() {
            return Err(Error::InvalidInput(format!(
                "completed map is {:?} but the environment is {:?}",
                completed.image().dimensions(),
                self.original.image().dimensions()
            )));
        }
        self.completed = completed;
        self.backend.clamp(self.completed.image_mut(), 0.0, 1.0);
        self.update_remaining()
    }

    /// True once every remaining channel value is below [`COMPLETION_EPSILON`].
    pub fn is_complete(&self) -> bool {
        self.remaining.image().is_below(COMPLETION_EPSILON)
    }

    /// The original environment as seen through the screen, border faded.
    pub fn show_environment(&self, pose: &ScreenPose) -> Result<RadianceImage, Error> {
        let mut screen = self.blank_screen();
        self.projector
            .project_forward(&self.backend, &mut screen, &self.original, pose, None)?;
        self.backend.multiply(&mut screen, &self.border_mask)?;
        Ok(screen)
    }

    /// Linearly map the original into the displayable radiance range.
    ///
    /// `original * (Dmax / Emax) + (Dmin - Emin)` with `D` the display bounds and
    /// `E` the environment extremes.
    pub fn fit_to_display_range(&mut self) -> Result<(), Error> {
        let d_max = self.max_light.max_value();
        let d_min = min_value(&self.min_light);
        let e_max = self.original.image().max_value();
        let e_min = min_value(self.original.image());
        if !(e_max > 0.0) {
            return Ok(());
        }
        let (gain, offset) = (d_max / e_max, d_min - e_min);
        info!(gain, offset, "fitting environment into display range");
        self.backend
            .for_each_pixel(self.original.image_mut(), &|_, _, px| {
                px.iter_mut().for_each(|v| *v = *v * gain + offset);
            });
        self.update_remaining()
    }

    /// The completed fraction as seen through the screen.
    pub fn project_completed(&self, pose: &ScreenPose) -> Result<RadianceImage, Error> {
        let mut screen = self.blank_screen();
        self.projector
            .project_forward(&self.backend, &mut screen, &self.completed, pose, None)?;
        Ok(screen)
    }

    /// Cube map of the region `pose` would light, weighted by the border fade.
    pub fn footprint(&self, pose: &ScreenPose) -> Result<CubeMap, Error> {
        let mut footprint = CubeMap::new(self.original.size());
        self.projector
            .project_backward(&self.backend, &mut footprint, &self.border_mask, pose)?;
        Ok(footprint)
    }

    /// Three stacked strips: original with the footprint, remaining, and
    /// completed with half the footprint.
    pub fn progress_view(
        &self,
        footprint: Option<&CubeMap>,
        width: usize,
        height: usize,
    ) -> Result<RadianceImage, Error> {
        let mut view = RadianceImage::new(width, height);
        let strip = height / 3;
        if width == 0 || strip == 0 {
            return Ok(view);
        }

        let mut top = self.original.image().clone();
        let mut bottom = self.completed.image().clone();
        if let Some(footprint) = footprint {
            self.backend.add(&mut top, footprint.image())?;
            let mut half = footprint.image().clone();
            self.backend.scale(&mut half, 0.5);
            self.backend.add(&mut bottom, &half)?;
        }

        for (i, img) in [&top, self.remaining.image(), &bottom].into_iter().enumerate() {
            view.paste(&img.resize(width, strip), 0, (i * strip) as i64);
        }
        Ok(view)
    }

    fn blank_screen(&self) -> RadianceImage {
        RadianceImage::new(self.geometry().width(), self.geometry().height())
    }

    fn update_remaining(&mut self) -> Result<(), Error> {
        let mut consumed = self.original.image().clone();
        self.backend.multiply(&mut consumed, self.completed.image())?;
        let mut remaining = self.original.image().clone();
        self.backend.subtract(&mut remaining, &consumed)?;
        *self.remaining.image_mut() = remaining;
        Ok(())
    }
}

fn min_value(img: &RadianceImage) -> f32 {
    img.pixels()
        .iter()
        .flat_map(|px| px.iter().copied())
        .fold(f32::INFINITY, f32::min)
}
