//! Camera initializers (spec §4.F): per-camera pose recovery before any LM
//! solve runs, and the top-level attempt ordering across the three
//! strategies (`vp`, `pnp`, `essential`).

pub mod essential;
pub mod pnp;
pub mod vp;

use crate::logger::{Logger, Tag};
use crate::project::Project;

/// Sanitise one camera's intrinsics before any initializer touches it (spec
/// §4.F): zero skew, unit aspect ratio, zero distortion, re-centre an
/// out-of-bounds principal point, and clamp focal length into
/// `[0.3·maxDim, 5·maxDim]`, replacing an out-of-range value with `maxDim`.
pub fn sanitize_intrinsics(project: &mut Project, viewpoint: usize) {
    let vp = &mut project.viewpoints[viewpoint];
    let max_dim = vp.max_dim();

    vp.intrinsics.skew = 0.0;
    vp.intrinsics.aspect_ratio = 1.0;
    vp.intrinsics.distortion = crate::geometry::Distortion::default();

    let (cx, cy) = vp.intrinsics.principal_point;
    if cx < 0.0 || cx > vp.width as f64 || cy < 0.0 || cy > vp.height as f64 {
        vp.intrinsics.principal_point = (vp.width as f64 / 2.0, vp.height as f64 / 2.0);
    }

    let (lo, hi) = (0.3 * max_dim, 5.0 * max_dim);
    if vp.intrinsics.focal_length < lo || vp.intrinsics.focal_length > hi {
        vp.intrinsics.focal_length = max_dim;
    }
}

/// The per-camera outcome of a §4.F initialization attempt, for reporting
/// back through `OptimizeResult::cameras_initialized`.
#[derive(Debug, Clone)]
pub struct CameraInitReport {
    pub viewpoint: usize,
    pub method: &'static str,
    pub succeeded: bool,
    pub reason: Option<String>,
}

/// Run the full §4.F attempt ordering: per camera try VP, else PnP; if
/// nothing initialised and ≥2 cameras remain uninitialised, try the
/// essential matrix on the best pair; finally attempt late PnP on any
/// remaining cameras using whatever world points are already fully
/// constrained or triangulated by that point. Cameras with zero observations
/// are left untouched and excluded from consideration entirely (spec §8
/// "a camera with zero observations: dropped from the solve").
pub fn initialize_cameras(project: &mut Project, logger: &mut Logger) -> Vec<CameraInitReport> {
    let mut reports = Vec::new();

    let observed: Vec<usize> = (0..project.viewpoints.len())
        .filter(|&i| project.image_points.iter().any(|ip| ip.viewpoint == i))
        .collect();

    for &vp in &observed {
        if project.viewpoints[vp].enabled_in_solve {
            sanitize_intrinsics(project, vp);
        }
    }

    let mut any_initialized = false;
    for &vp in &observed {
        if !project.viewpoints[vp].enabled_in_solve || project.viewpoints[vp].is_initialized {
            continue;
        }
        if vp::initialize(project, vp) {
            logger.log(Tag::Init, format!("camera {vp} initialised via vanishing points"));
            reports.push(CameraInitReport { viewpoint: vp, method: "vp", succeeded: true, reason: None });
            any_initialized = true;
            continue;
        }
        match pnp::initialize(project, vp) {
            Ok(()) => {
                logger.log(Tag::Init, format!("camera {vp} initialised via PnP"));
                reports.push(CameraInitReport { viewpoint: vp, method: "pnp", succeeded: true, reason: None });
                any_initialized = true;
            }
            Err(reason) => {
                logger.log(Tag::Init, format!("camera {vp} not initialised (vp/pnp): {reason}"));
                reports.push(CameraInitReport { viewpoint: vp, method: "pnp", succeeded: false, reason: Some(reason) });
            }
        }
    }

    let still_uninitialized: Vec<usize> = observed
        .iter()
        .copied()
        .filter(|&vp| project.viewpoints[vp].enabled_in_solve && !project.viewpoints[vp].is_initialized)
        .collect();

    if !any_initialized && still_uninitialized.len() >= 2 {
        match essential::best_pair(project) {
            Some((a, b)) => match essential::initialize_pair(project, a, b) {
                Ok(()) => {
                    logger.log(Tag::Init, format!("cameras {a},{b} initialised via essential matrix"));
                    reports.push(CameraInitReport { viewpoint: a, method: "essential", succeeded: true, reason: None });
                    reports.push(CameraInitReport { viewpoint: b, method: "essential", succeeded: true, reason: None });
                }
                Err(reason) => {
                    logger.log(Tag::Warn, format!("essential-matrix init failed for {a},{b}: {reason}"));
                    reports.push(CameraInitReport { viewpoint: a, method: "essential", succeeded: false, reason: Some(reason) });
                }
            },
            None => {
                logger.log(Tag::Warn, "no camera pair has >= 7 shared observations for essential-matrix init".to_string());
            }
        }
    }

    reports
}

/// Late PnP (spec §4.F/§4.J step 6): after triangulation has produced
/// `optimized_xyz` for some points, retry PnP on any camera still
/// uninitialized that now observes ≥3 fully-constrained-or-triangulated
/// points.
pub fn late_pnp(project: &mut Project, logger: &mut Logger) -> Vec<CameraInitReport> {
    let mut reports = Vec::new();
    for vp in 0..project.viewpoints.len() {
        if !project.viewpoints[vp].enabled_in_solve || project.viewpoints[vp].is_initialized {
            continue;
        }
        if !project.image_points.iter().any(|ip| ip.viewpoint == vp) {
            continue;
        }
        match pnp::initialize(project, vp) {
            Ok(()) => {
                logger.log(Tag::Init, format!("camera {vp} initialised via late PnP"));
                reports.push(CameraInitReport { viewpoint: vp, method: "late_pnp", succeeded: true, reason: None });
            }
            Err(reason) => {
                logger.log(Tag::Init, format!("camera {vp} not initialised (late PnP): {reason}"));
                reports.push(CameraInitReport { viewpoint: vp, method: "late_pnp", succeeded: false, reason: Some(reason) });
            }
        }
    }
    reports
}
