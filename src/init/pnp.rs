//! PnP camera initializer (spec §4.F): recovers a camera's pose from ≥3
//! fully-constrained world points it observes, via a direct linear transform
//! (the classical EPnP-style linear stage, restricted to extrinsics since
//! intrinsics are already known/sanitised) followed by local refinement
//! through the same Levenberg–Marquardt machinery the full solve uses on a
//! single-camera subproblem.

use nalgebra::{DMatrix, Matrix3, SVD, Vector3, Vector4};

use crate::lm::{self, LmOptions};
use crate::logger::Logger;
use crate::project::{ImagePoint, Project, Viewpoint, WorldPoint};
use crate::residuals::{quat_norm, reprojection};
use crate::variables::{IntrinsicsPolicy, VariableLayout};

/// Reject a refined pose whose median reprojection residual (pixels) exceeds
/// this fraction of the image's largest dimension (spec §4.F "unreliable").
const MEDIAN_RESIDUAL_FRACTION: f64 = 0.1;

struct Correspondence {
    world: Vector3<f64>,
    direction: Vector3<f64>,
}

fn gather_correspondences(project: &Project, viewpoint: usize) -> Vec<Correspondence> {
    let vp = &project.viewpoints[viewpoint];
    project
        .image_points
        .iter()
        .filter(|ip| ip.viewpoint == viewpoint)
        .filter_map(|ip| {
            let world = project.world_points[ip.world_point].effective_point()?;
            let xd = (ip.observed_u - vp.intrinsics.principal_point.0) / vp.intrinsics.fx();
            let yd = (vp.intrinsics.principal_point.1 - ip.observed_v) / vp.intrinsics.fy();
            let (xn, yn) = vp.intrinsics.distortion.undistort(xd, yd);
            Some(Correspondence { world, direction: Vector3::new(xn, yn, 1.0) })
        })
        .collect()
}

/// Linear DLT stage: solve the homogeneous system `d × (R·p + T) = 0` for the
/// 12 unknowns of `(R, T)` by taking the smallest right-singular vector, then
/// project `R` back onto the rotation manifold.
fn linear_pose_estimate(correspondences: &[Correspondence]) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    if correspondences.len() < 3 {
        return None;
    }
    let n = correspondences.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 12);

    for (i, c) in correspondences.iter().enumerate() {
        let (px, py, pz) = (c.world.x, c.world.y, c.world.z);
        let (xn, yn) = (c.direction.x, c.direction.y);

        // eq1: yn*r3.p - r2.p + yn*t3 - t2 = 0
        let row0 = 2 * i;
        a[(row0, 3)] = -px;
        a[(row0, 4)] = -py;
        a[(row0, 5)] = -pz;
        a[(row0, 6)] = yn * px;
        a[(row0, 7)] = yn * py;
        a[(row0, 8)] = yn * pz;
        a[(row0, 10)] = -1.0;
        a[(row0, 11)] = yn;

        // eq2: r1.p - xn*r3.p + t1 - xn*t3 = 0
        let row1 = 2 * i + 1;
        a[(row1, 0)] = px;
        a[(row1, 1)] = py;
        a[(row1, 2)] = pz;
        a[(row1, 6)] = -xn * px;
        a[(row1, 7)] = -xn * py;
        a[(row1, 8)] = -xn * pz;
        a[(row1, 9)] = 1.0;
        a[(row1, 11)] = -xn;
    }

    let svd = SVD::try_new(a, true, true, 1e-9, 200)?;
    let v_t = svd.v_t?;
    let null_vec = v_t.row(v_t.nrows() - 1).transpose();

    let mut r_raw = Matrix3::zeros();
    for row in 0..3 {
        for col in 0..3 {
            r_raw[(row, col)] = null_vec[row * 3 + col];
        }
    }
    let t_raw = Vector3::new(null_vec[9], null_vec[10], null_vec[11]);

    let scale = 3.0 / (r_raw.row(0).norm() + r_raw.row(1).norm() + r_raw.row(2).norm());
    let sign = if r_raw.determinant() < 0.0 { -1.0 } else { 1.0 };

    let r_svd = SVD::try_new(r_raw * sign, true, true, 1e-9, 0)?;
    let u = r_svd.u?;
    let v_t2 = r_svd.v_t?;
    let mut s = Matrix3::identity();
    if (u * v_t2).determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }
    let rotation = u * s * v_t2;
    let translation = t_raw * sign * scale;

    Some((rotation, translation))
}

/// Refine `(rotation, translation)` by running the ordinary reprojection +
/// quaternion-normalization residuals over just this camera's 6 pose degrees
/// of freedom, with every world point held fixed (it is fully constrained by
/// construction).
fn refine_pose(project: &Project, viewpoint: usize, rotation: Matrix3<f64>, translation: Vector3<f64>) -> (Vector3<f64>, Vector4<f64>, f64) {
    let campos = -rotation.transpose() * translation;
    let quat = crate::geometry::quat_from_rotation_matrix(&rotation);

    let mut sub = Project::new();
    let vp = &project.viewpoints[viewpoint];
    let mut sub_vp = Viewpoint {
        pose: crate::project::Pose { position: campos, quaternion: quat },
        ..vp.clone()
    };
    sub_vp.is_pose_locked = false;
    sub_vp.enabled_in_solve = true;
    sub.viewpoints.push(sub_vp);

    for ip in project.image_points.iter().filter(|ip| ip.viewpoint == viewpoint) {
        let Some(p) = project.world_points[ip.world_point].effective_point() else { continue };
        sub.world_points.push(WorldPoint::locked([p.x, p.y, p.z]));
        let idx = sub.world_points.len() - 1;
        sub.image_points.push(ImagePoint::new(idx, 0, ip.observed_u, ip.observed_v));
    }

    let layout = VariableLayout::build(&sub, IntrinsicsPolicy::Never);
    let mut rows = Vec::new();
    for ip in &sub.image_points {
        let (u, v) = reprojection::build(&layout, &sub, ip.world_point, 0, ip.observed_u, ip.observed_v);
        rows.push(u);
        rows.push(v);
    }
    if let Some(q) = quat_norm::build(&layout, &sub, 0) {
        rows.push(q);
    }

    let mut logger = Logger::new(false);
    let result = lm::optimize(layout.n(), &rows, layout.initial(), &LmOptions::default(), &mut logger);

    let refined_campos = layout.effective_camera_position(&sub, &result.x, 0);
    let refined_quat = layout.effective_camera_quaternion(&sub, &result.x, 0);

    let residuals_px: Vec<f64> = sub
        .image_points
        .iter()
        .map(|ip| {
            let world = sub.world_points[ip.world_point].determined_point().unwrap();
            let cam = crate::geometry::quat_to_matrix(&refined_quat) * (world - refined_campos);
            let (xn, yn) = (cam.x / cam.z, cam.y / cam.z);
            let vp = &project.viewpoints[viewpoint];
            let dist = vp.intrinsics.distortion.apply(xn, yn);
            let pu = vp.intrinsics.fx() * dist.xd + vp.intrinsics.principal_point.0;
            let pv = vp.intrinsics.principal_point.1 - vp.intrinsics.fy() * dist.yd;
            ((pu - ip.observed_u).powi(2) + (pv - ip.observed_v).powi(2)).sqrt()
        })
        .collect();

    let median_residual = median(&residuals_px);
    (refined_campos, refined_quat, median_residual)
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted[sorted.len() / 2]
}

/// Attempt PnP initialization for `viewpoint`. On success, writes `pose` and
/// sets `is_initialized`. Returns `Err(reason)` on failure (spec §4.F "emit a
/// reason string").
pub fn initialize(project: &mut Project, viewpoint: usize) -> Result<(), String> {
    let correspondences = gather_correspondences(project, viewpoint);
    if correspondences.len() < 3 {
        return Err(format!("fewer than 3 fully-constrained observed points ({})", correspondences.len()));
    }

    let Some((rotation, translation)) = linear_pose_estimate(&correspondences) else {
        return Err("DLT linear system was singular".into());
    };

    let (campos, quat, median_residual) = refine_pose(project, viewpoint, rotation, translation);
    let max_dim = project.viewpoints[viewpoint].max_dim();
    if median_residual > MEDIAN_RESIDUAL_FRACTION * max_dim {
        return Err(format!("median residual {median_residual:.1}px exceeds reliability threshold"));
    }

    let centroid = correspondences.iter().fold(Vector3::zeros(), |acc, c| acc + c.world) / correspondences.len() as f64;
    let r_final = crate::geometry::quat_to_matrix(&quat);
    if (r_final * (centroid - campos)).z <= 0.0 {
        return Err("camera placed behind the observed points' centroid".into());
    }

    let vp = &mut project.viewpoints[viewpoint];
    vp.pose.position = campos;
    vp.pose.quaternion = quat;
    vp.is_initialized = true;
    Ok(())
}
