//! Vanishing-point camera initializer (spec §4.F).
//!
//! Each annotated vanishing line gives one column of the camera's rotation
//! matrix directly: `quatRotate(q, e_axis)` is by definition column `axis` of
//! `R`, so a vanishing direction observed for axis `i` *is* that column,
//! expressed in the camera frame. Two independent axes pin the full
//! orientation (the third column follows from orthonormality); position is
//! then a small linear least-squares solve against any fully-constrained
//! points this camera observes.

use nalgebra::{Matrix3, Vector3};

use crate::linalg::{solve_spd, NormalMatrix};
use crate::project::{Axis, Project};

/// Lift a normalized 2D pixel direction to an (unnormalized) camera-frame 3D
/// direction, matching [`crate::residuals::vanishing`]'s convention.
fn lift_direction(du: f64, dv: f64, fx: f64, fy: f64) -> Vector3<f64> {
    Vector3::new(du / fx, -dv / fy, 1.0).normalize()
}

/// Recover camera orientation from ≥2 distinct-axis vanishing lines.
/// `None` if fewer than 2 distinct axes are annotated.
fn recover_rotation(project: &Project, viewpoint: usize) -> Option<Matrix3<f64>> {
    let vp = &project.viewpoints[viewpoint];
    let mut by_axis: [Option<Vector3<f64>>; 3] = [None, None, None];
    for vl in &vp.vanishing_lines {
        let dir = lift_direction(vl.direction_px.0, vl.direction_px.1, vp.intrinsics.fx(), vp.intrinsics.fy());
        by_axis[vl.axis.index()] = Some(dir);
    }

    let known: Vec<(usize, Vector3<f64>)> = by_axis
        .iter()
        .enumerate()
        .filter_map(|(i, d)| d.map(|d| (i, d)))
        .collect();
    if known.len() < 2 {
        return None;
    }

    let (i0, d0) = known[0];
    let (i1, d1_raw) = known[1];
    let c0 = d0.normalize();
    // Gram-Schmidt: remove the c0 component from d1, keeping right angles exact.
    let mut c1 = d1_raw - c0 * c0.dot(&d1_raw);
    if c1.norm() < 1e-9 {
        return None;
    }
    c1 = c1.normalize();
    let c2 = c0.cross(&c1);

    let remaining = (0..3).find(|i| *i != i0 && *i != i1)?;
    let mut r = Matrix3::zeros();
    r.set_column(i0, &c0);
    r.set_column(i1, &c1);
    r.set_column(remaining, &c2);

    Some(r)
}

/// Points the camera can use to solve for its position: world points that are
/// fully constrained (locked or inferred) and observed by this camera.
fn position_observations(project: &Project, viewpoint: usize) -> Vec<(Vector3<f64>, Vector3<f64>)> {
    let vp = &project.viewpoints[viewpoint];
    project
        .image_points
        .iter()
        .filter(|ip| ip.viewpoint == viewpoint)
        .filter_map(|ip| {
            let wp = &project.world_points[ip.world_point];
            let p = wp.determined_point()?;
            let (xd, yd) = (
                (ip.observed_u - vp.intrinsics.principal_point.0) / vp.intrinsics.fx(),
                (vp.intrinsics.principal_point.1 - ip.observed_v) / vp.intrinsics.fy(),
            );
            let (xn, yn) = vp.intrinsics.distortion.undistort(xd, yd);
            Some((p, Vector3::new(xn, yn, 1.0)))
        })
        .collect()
}

/// Solve `campos` from the linear system `([d]_x R) campos = [d]_x R p` built
/// from each (world point, observed direction) pair with known rotation `r`.
fn solve_position(observations: &[(Vector3<f64>, Vector3<f64>)], r: &Matrix3<f64>) -> Option<Vector3<f64>> {
    if observations.len() < 2 {
        return None;
    }
    let mut ata = NormalMatrix::zeros(3);
    let mut atb = nalgebra::DVector::zeros(3);

    for (p, d) in observations {
        let skew_d = crate::geometry::skew(d);
        let a = skew_d * r; // 3x3
        let b = a * p;
        for i in 0..3 {
            for j in 0..3 {
                ata.add(i, j, a.column(i).dot(&a.column(j)));
            }
            atb[i] += a.column(i).dot(&b);
        }
    }
    let neg_atb = -atb;
    let sol = solve_spd(&ata.as_dense(), &neg_atb)?;
    Some(Vector3::new(sol[0], sol[1], sol[2]))
}

/// Check that the majority of `observations` project in front of the camera
/// (`camZ > 0`) under `(rotation, position)` (spec §4.F "validate by
/// reprojecting and checking cheirality").
fn majority_in_front(observations: &[(Vector3<f64>, Vector3<f64>)], rotation: &Matrix3<f64>, position: Vector3<f64>) -> bool {
    if observations.is_empty() {
        return true;
    }
    let in_front = observations
        .iter()
        .filter(|(p, _)| (rotation * (p - position)).z > 0.0)
        .count();
    in_front * 2 >= observations.len()
}

/// Attempt vanishing-point initialization for `viewpoint`. On success, writes
/// `pose` and sets `is_initialized`. Returns whether it succeeded.
pub fn initialize(project: &mut Project, viewpoint: usize) -> bool {
    let Some(rotation) = recover_rotation(project, viewpoint) else {
        return false;
    };
    let observations = position_observations(project, viewpoint);
    let position = match solve_position(&observations, &rotation) {
        Some(p) => p,
        None => Vector3::new(0.0, 0.0, -10.0 * estimate_scale(project)),
    };

    if !majority_in_front(&observations, &rotation, position) {
        return false;
    }

    let quat = crate::geometry::quat_from_rotation_matrix(&rotation);
    let vp = &mut project.viewpoints[viewpoint];
    vp.pose.position = position;
    vp.pose.quaternion = quat;
    vp.is_initialized = true;
    true
}

fn estimate_scale(project: &Project) -> f64 {
    project.lines.iter().filter_map(|l| l.target_length).fold(1.0_f64, f64::max)
}
