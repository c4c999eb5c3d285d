//! Reprojection residual (spec §4.C), the dominant provider family (≈22%
//! share of the component budget).
//!
//! Two scalar rows per [`crate::project::ImagePoint`]:
//!
//! ```text
//! U:  fx·(x_c/z_c) + cx + distortion_u − observedU
//! V:  cy − fy·(y_c/z_c) − distortion_v − observedV
//! ```
//!
//! where `(x_c, y_c, z_c) = quatRotate(q, world − camPos)` via the
//! non-unit-safe Hamilton formula. Distortion is applied in normalized
//! coordinates before scaling by `fx`/`fy` (spec §4.C). Since `optimizeCameraIntrinsics`
//! only ever frees `focalLength` (never `fx`/`fy` independently, and never
//! `cx`/`cy`/skew/distortion — see spec §4.B), `fy = f·aspectRatio` is a
//! fixed-ratio function of the one free intrinsic, which keeps the
//! `∂/∂focalLength` column to a single term per row instead of two
//! independent ones.

use std::sync::Arc;

use nalgebra::{DVector, Vector3, Vector4};

use crate::geometry::{quat_rotate_with_jacobian, quat_to_matrix};
use crate::project::Project;
use crate::residuals::{Coord, Row};
use crate::variables::VariableLayout;

struct CamProjection {
    ru: f64,
    rv: f64,
    grad_u: Vec<f64>,
    grad_v: Vec<f64>,
}

/// Evaluate both residuals and both 11-wide gradients (world point, camera
/// position, quaternion, focal length) in one pass, shared by the U and V
/// rows so the rotation/distortion chain is computed once per call site.
fn project_point(coords: &[Coord], aspect_ratio: f64, cx: f64, cy: f64, distortion: crate::geometry::Distortion, observed_u: f64, observed_v: f64, x: &DVector<f64>) -> CamProjection {
    let v: Vec<f64> = coords.iter().map(|c| c.value(x)).collect();
    let world = Vector3::new(v[0], v[1], v[2]);
    let cam_pos = Vector3::new(v[3], v[4], v[5]);
    let q = Vector4::new(v[6], v[7], v[8], v[9]);
    let f = v[10];
    let fx = f;
    let fy = f * aspect_ratio;

    let t = world - cam_pos;
    let (cam, dq) = quat_rotate_with_jacobian(&q, &t);
    let r = quat_to_matrix(&q);

    let (xc, yc, zc) = (cam.x, cam.y, cam.z);
    let xn = xc / zc;
    let yn = yc / zc;

    let dist = distortion.apply(xn, yn);

    let dxn = Vector3::new(1.0 / zc, 0.0, -xc / (zc * zc));
    let dyn_ = Vector3::new(0.0, 1.0 / zc, -yc / (zc * zc));

    let dxd_dcam = dist.jac[0][0] * dxn + dist.jac[0][1] * dyn_;
    let dyd_dcam = dist.jac[1][0] * dxn + dist.jac[1][1] * dyn_;

    let du_dcam = fx * dxd_dcam;
    let dv_dcam = -fy * dyd_dcam;

    let du_dworld = r.transpose() * du_dcam;
    let du_dcampos = -(r.transpose() * du_dcam);
    let du_dquat = dq.transpose() * du_dcam;
    let du_df = dist.xd;

    let dv_dworld = r.transpose() * dv_dcam;
    let dv_dcampos = -(r.transpose() * dv_dcam);
    let dv_dquat = dq.transpose() * dv_dcam;
    let dv_df = -aspect_ratio * dist.yd;

    let u_pred = fx * dist.xd + cx;
    let v_pred = cy - fy * dist.yd;

    CamProjection {
        ru: u_pred - observed_u,
        rv: v_pred - observed_v,
        grad_u: vec![
            du_dworld.x, du_dworld.y, du_dworld.z,
            du_dcampos.x, du_dcampos.y, du_dcampos.z,
            du_dquat[0], du_dquat[1], du_dquat[2], du_dquat[3],
            du_df,
        ],
        grad_v: vec![
            dv_dworld.x, dv_dworld.y, dv_dworld.z,
            dv_dcampos.x, dv_dcampos.y, dv_dcampos.z,
            dv_dquat[0], dv_dquat[1], dv_dquat[2], dv_dquat[3],
            dv_df,
        ],
    }
}

fn gather_coords(layout: &VariableLayout, project: &Project, world_point: usize, viewpoint: usize) -> Vec<Coord> {
    let wp_idx = layout.world_point_idx(world_point);
    let cp_idx = layout.camera_pos_idx(viewpoint);
    let quat_idx = layout.camera_quat_idx(viewpoint);
    let focal_idx = layout.camera_focal_idx(viewpoint);
    let vp = &project.viewpoints[viewpoint];

    let mut coords = Vec::with_capacity(11);
    for axis in 0..3 {
        coords.push(match wp_idx[axis] {
            Some(i) => Coord::free(i),
            None => Coord::fixed(layout.locked_value(project, world_point, axis)),
        });
    }
    for axis in 0..3 {
        coords.push(match cp_idx[axis] {
            Some(i) => Coord::free(i),
            None => Coord::fixed(vp.pose.position[axis]),
        });
    }
    match quat_idx {
        Some(idx) => idx.iter().for_each(|&i| coords.push(Coord::free(i))),
        None => (0..4).for_each(|i| coords.push(Coord::fixed(vp.pose.quaternion[i]))),
    }
    coords.push(match focal_idx {
        Some(i) => Coord::free(i),
        None => Coord::fixed(vp.intrinsics.focal_length),
    });
    coords
}

/// Build the (U, V) row pair for one observation of `world_point` by
/// `viewpoint`.
pub fn build(
    layout: &VariableLayout,
    project: &Project,
    world_point: usize,
    viewpoint: usize,
    observed_u: f64,
    observed_v: f64,
) -> (Row, Row) {
    let coords = gather_coords(layout, project, world_point, viewpoint);
    let vp = &project.viewpoints[viewpoint];
    let aspect_ratio = vp.intrinsics.aspect_ratio;
    let (cx, cy) = vp.intrinsics.principal_point;
    let distortion = vp.intrinsics.distortion;

    let coords_for_eval = coords.clone();
    let eval = Arc::new(move |x: &DVector<f64>| -> CamProjection {
        project_point(&coords_for_eval, aspect_ratio, cx, cy, distortion, observed_u, observed_v, x)
    });

    let eval_u = eval.clone();
    let row_u = Row::new(coords.clone(), move |x: &DVector<f64>| {
        let p = eval_u(x);
        (p.ru, p.grad_u)
    });
    let row_v = Row::new(coords, move |x: &DVector<f64>| {
        let p = eval(x);
        (p.rv, p.grad_v)
    });

    (row_u, row_v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residuals::central_difference_gradient;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;

    #[test]
    fn gradients_match_central_difference() {
        let mut project = Project::new();
        project.world_points.push(crate::project::WorldPoint::free());
        let mut vp = crate::project::Viewpoint::default();
        vp.pose.position = Vector3::new(0.0, 0.0, -20.0);
        vp.intrinsics.focal_length = 1000.0;
        vp.intrinsics.principal_point = (500.0, 500.0);
        vp.intrinsics.distortion = crate::geometry::Distortion {
            k1: 0.05,
            k2: -0.01,
            k3: 0.0,
            p1: 0.001,
            p2: -0.0005,
        };
        project.viewpoints.push(vp);

        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Always);
        let mut x = layout.initial().clone();
        let wp_idx = layout.world_point_idx(0);
        x[wp_idx[0].unwrap()] = 2.0;
        x[wp_idx[1].unwrap()] = -1.0;
        x[wp_idx[2].unwrap()] = 3.0;
        let quat_idx = layout.camera_quat_idx(0).unwrap();
        x[quat_idx[0]] = 0.95;
        x[quat_idx[1]] = 0.1;
        x[quat_idx[2]] = -0.05;
        x[quat_idx[3]] = 0.02;

        let (row_u, row_v) = build(&layout, &project, 0, 0, 510.0, 495.0);

        for row in [&row_u, &row_v] {
            let analytical = row.gradient(&x);
            let numerical = central_difference_gradient(row, &x);
            for (a, n) in analytical.iter().zip(numerical.iter()) {
                assert_relative_eq!(a, n, epsilon = 1e-3, max_relative = 1e-2);
            }
        }
    }
}
