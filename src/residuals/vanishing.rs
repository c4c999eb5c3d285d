//! Vanishing-line residual (spec §4.C): `weight·(1 − cos∠(predicted, observed))`
//! per annotated `(camera, axis)` pair, used to anchor rotation and
//! optionally focal length.
//!
//! `predicted = quatRotate(q, e_axis)`; `observed` is the annotated 2D line
//! direction lifted to a 3D camera-frame ray via the current intrinsics:
//! `raw = (du/fx, −dv/fy, 1)`, normalized. Because `predicted` is not
//! renormalized to unit length (`q` may be non-unit, spec §3/§9), the cosine
//! is computed as `predicted·n / ‖predicted‖` rather than assuming both
//! operands are unit vectors.

use std::sync::Arc;

use nalgebra::{DVector, Vector3, Vector4};

use crate::geometry::quat_rotate_with_jacobian;
use crate::project::{Axis, Project};
use crate::residuals::{Coord, Row};
use crate::variables::VariableLayout;

struct Eval {
    rho: f64,
    grad_quat: Vector4<f64>,
    grad_f: f64,
}

fn evaluate(e_axis: Vector3<f64>, aspect_ratio: f64, du: f64, dv: f64, q: Vector4<f64>, f: f64) -> Eval {
    let (predicted, dq) = quat_rotate_with_jacobian(&q, &e_axis);
    let pred_norm = predicted.norm();

    let fx = f;
    let fy = f * aspect_ratio;
    let raw = Vector3::new(du / fx, -dv / fy, 1.0);
    let raw_norm = raw.norm();
    let n = raw / raw_norm;

    let dot = predicted.dot(&n);
    let cos = dot / pred_norm;

    let u = predicted / pred_norm;
    let dcos_dpred = n / pred_norm - predicted * (dot / pred_norm.powi(3));
    let dcos_dq = dq.transpose() * dcos_dpred;

    let dcos_draw = (u - n * n.dot(&u)) / raw_norm;
    let draw_df = Vector3::new(-du / (f * f), dv / (f * f * aspect_ratio), 0.0);
    let dcos_df = dcos_draw.dot(&draw_df);

    Eval {
        rho: 1.0 - cos,
        grad_quat: -dcos_dq,
        grad_f: -dcos_df,
    }
}

/// Build one row for a `(viewpoint, axis)` vanishing-line annotation.
/// Returns `None` when the camera has neither a free pose nor a free focal
/// length (the row would carry zero variables and contribute nothing).
pub fn build(layout: &VariableLayout, project: &Project, viewpoint: usize, axis: Axis, direction_px: (f64, f64), weight: f64) -> Option<Row> {
    let quat_idx = layout.camera_quat_idx(viewpoint);
    let focal_idx = layout.camera_focal_idx(viewpoint);
    if quat_idx.is_none() && focal_idx.is_none() {
        return None;
    }

    let vp = &project.viewpoints[viewpoint];
    let fixed_quat = vp.pose.quaternion;
    let fixed_focal = vp.intrinsics.focal_length;
    let aspect_ratio = vp.intrinsics.aspect_ratio;
    let e_axis = axis.unit_vector();
    let (du, dv) = direction_px;

    let mut coords: Vec<Coord> = match quat_idx {
        Some(idx) => idx.iter().map(|&i| Coord::free(i)).collect(),
        None => (0..4).map(|i| Coord::fixed(fixed_quat[i])).collect(),
    };
    coords.push(match focal_idx {
        Some(i) => Coord::free(i),
        None => Coord::fixed(fixed_focal),
    });

    let coords_for_eval = coords.clone();
    let eval = Arc::new(move |x: &DVector<f64>| {
        let q = Vector4::new(
            x_or(&coords_for_eval, 0, x),
            x_or(&coords_for_eval, 1, x),
            x_or(&coords_for_eval, 2, x),
            x_or(&coords_for_eval, 3, x),
        );
        let f = x_or(&coords_for_eval, 4, x);
        evaluate(e_axis, aspect_ratio, du, dv, q, f)
    });

    Some(Row::new(coords, move |x: &DVector<f64>| {
        let e = eval(x);
        (
            weight * e.rho,
            vec![
                weight * e.grad_quat[0],
                weight * e.grad_quat[1],
                weight * e.grad_quat[2],
                weight * e.grad_quat[3],
                weight * e.grad_f,
            ],
        )
    }))
}

fn x_or(coords: &[Coord], i: usize, x: &DVector<f64>) -> f64 {
    coords[i].value(x)
}
