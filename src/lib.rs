//! Reproject equirectangular (ERP) panoramas captured along a camera trajectory into perspective
//! views.
//!
//! Two exports are supported:
//! - cubic export: one perspective view per requested direction (the six cube faces by default)
//!   for every panorama, see [cubic].
//! - ring stereo export: frames `k` apart on the trajectory are reprojected onto a ring of tangent
//!   perspective cameras orthogonal to the local motion direction, giving rectified stereo pairs,
//!   see [stereo].
//!
//! Example usage:
//! ```
//! use pano2persp::*;
//! use pano2persp::stereo::*;
//! use cgmath::Vector3;
//!
//! // ten poses, 4cm apart, moving along +z
//! let trajectory = synthetic::line_trajectory(10, 0.04, 0.0);
//! // pairs two frames apart, rejecting baselines below 5cm
//! let plan = plan_pairs(&trajectory, 2, Vector3::new(0.0, 1.0, 0.0), 0.05);
//! assert_eq!(plan.pairs.len(), 8);
//! ```

extern crate byteorder;
extern crate cgmath;
extern crate image;
extern crate indicatif;
extern crate itertools;
extern crate log;
extern crate nom;
extern crate rand;
extern crate rayon;
extern crate thiserror;

pub mod camera;
pub mod cubic;
pub mod erp;
pub mod job;
pub mod stereo;
pub mod synthetic;
pub mod trajectory;

pub use camera::*;
pub use erp::*;
pub use job::*;
pub use trajectory::*;

use std::path::PathBuf;

/// Errors raised by the reprojection engine and its file boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid job parameters. Fatal for the job (or the single list entry it names).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two vectors that must span a plane are (nearly) parallel, or a direction has zero length.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// A panorama or mask referenced by the trajectory could not be loaded.
    #[error("missing source {}: {reason}", path.display())]
    MissingSource { path: PathBuf, reason: String },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}
