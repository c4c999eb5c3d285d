//! Error taxonomy for the solver pipeline (see spec §7).
//!
//! Component-level failures (a camera that can't be initialized, a singular
//! linear solve) are absorbed by [`crate::pipeline`] and turned into either a
//! skipped camera or a returned [`Error`]; only caller misuse (a malformed
//! [`crate::project::Project`]) panics.

use thiserror::Error;

/// Errors returned by [`crate::pipeline::optimize`].
///
/// These are the "precondition failure", "initialization unreliable" (when it
/// escalates to a hard stop), and numerical-failure branches of spec §7.
/// Per-camera initialization failures that do *not* abort the whole solve are
/// not represented here; they are recorded in
/// [`crate::pipeline::OptimizeResult::cameras_excluded`] / skipped silently
/// per §4.F.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Not enough data to attempt any initializer for the scene as a whole,
    /// e.g. fewer than 7 shared points for essential-matrix init with no PnP
    /// or vanishing-point alternative available.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The Levenberg–Marquardt driver exhausted its retry budget without
    /// finding an accepted step.
    #[error("levenberg-marquardt diverged after {iterations} iterations")]
    Diverged { iterations: usize },

    /// A residual or gradient evaluated to a non-finite value repeatedly.
    #[error("numeric failure: {0}")]
    NumericFailure(String),

    /// Wraps a geometry-library error from `cam_geom`.
    #[error("cam_geom error: {source}")]
    CamGeom {
        #[from]
        source: cam_geom::Error,
    },

    /// Wraps a geometry-library error from `opencv_ros_camera`.
    #[error("opencv_ros_camera error: {source}")]
    OpencvRosCamera {
        #[from]
        source: opencv_ros_camera::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
