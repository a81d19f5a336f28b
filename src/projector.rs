//! Perspective mapping between the cube map and a posed screen.
//!
//! Every cube face is treated as an infinite plane at unit distance from the
//! origin. The four screen corners, projected onto that plane, give four
//! correspondences from which a face-to-screen homography is solved:
//!
//! ```text
//!        face plane                 screen
//!     +-------------+          0 +---------+ 1
//!     |   0 .---. 1 |   H         |         |
//!     |     |   |   |  ---->      |         |
//!     |   2 '---' 3 |           2 +---------+ 3
//!     +-------------+
//! ```

use crate::{
    cube::{CubeMap, Face},
    error::Error,
    homography::Homography,
    image::{ImageBackend, RadianceImage},
    screen::{ScreenGeometry, ScreenPose},
};
use nalgebra::Point2;
use std::collections::BTreeSet;
use tracing::debug;

/// Maps light between a cube map with faces of `cube_size` pixels and a screen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projector {
    geometry: ScreenGeometry,
    cube_size: usize,
}

impl Projector {
    pub fn new(geometry: ScreenGeometry, cube_size: usize) -> Self {
        Self {
            geometry,
            cube_size,
        }
    }

    pub fn geometry(&self) -> &ScreenGeometry {
        &self.geometry
    }

    pub fn cube_size(&self) -> usize {
        self.cube_size
    }

    /// Faces seen through the screen, in face order.
    ///
    /// Only the outer screen pixels are tested. This is exact as long as the
    /// screen covers less than a quarter turn as seen from the origin.
    pub fn sides_to_project(&self, pose: &ScreenPose) -> Vec<Face> {
        self.geometry
            .edge_pixels()
            .into_iter()
            .map(|(x, y)| {
                let pos = self.geometry.pixel_position(pose, x as f64, y as f64);
                Face::for_direction(&pos)
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Homography from pixels of `face` to screen pixels.
    ///
    /// Returns `None` if a screen corner lies on or behind the face plane, or if
    /// the projected corners are degenerate.
    pub fn perspective_transform(&self, face: Face, pose: &ScreenPose) -> Option<Homography> {
        let corners = self.geometry.corners(pose);
        let mut face_points = [Point2::origin(); 4];
        for (dst, corner) in face_points.iter_mut().zip(corners.iter()) {
            *dst = face.project(corner, self.cube_size)?;
        }
        Homography::from_correspondences(&face_points, &self.geometry.corner_pixels())
    }

    /// Add the light of the visible faces of `env` into `screen`.
    ///
    /// With `faces` set to `None` the visible faces are determined from `pose`.
    pub fn project_forward<B: ImageBackend + ?Sized>(
        &self,
        backend: &B,
        screen: &mut RadianceImage,
        env: &CubeMap,
        pose: &ScreenPose,
        faces: Option<&[Face]>,
    ) -> Result<(), Error> {
        self.check_cube(env)?;
        let faces = match faces {
            Some(faces) => faces.to_vec(),
            None => self.sides_to_project(pose),
        };
        let (width, height) = self.geometry.pixels();

        for face in faces {
            let Some(to_face) = self
                .perspective_transform(face, pose)
                .and_then(|h| h.inverse())
            else {
                debug!(?face, "skipping face without a valid projection");
                continue;
            };
            let warped = backend.warp(&env.face(face), &to_face, width, height);
            backend.add(screen, &warped)?;
        }
        Ok(())
    }

    /// Add `screen` back onto the faces of `env` it covers.
    pub fn project_backward<B: ImageBackend + ?Sized>(
        &self,
        backend: &B,
        env: &mut CubeMap,
        screen: &RadianceImage,
        pose: &ScreenPose,
    ) -> Result<(), Error> {
        self.check_cube(env)?;
        for face in self.sides_to_project(pose) {
            let Some(to_screen) = self.perspective_transform(face, pose) else {
                debug!(?face, "skipping face without a valid projection");
                continue;
            };
            let warped = backend.warp(screen, &to_screen, self.cube_size, self.cube_size);
            env.add_to_face(face, &warped)?;
        }
        Ok(())
    }

    fn check_cube(&self, env: &CubeMap) -> Result<(), Error> {
        if env.size() != self.cube_size {
            return Err(Error::InvalidInput(format!(
                "cube map faces are {} pixels but the projector expects {}",
                env.size(),
                self.cube_size
            )));
        }
        Ok(())
    }
}
