//! Quaternion normalization residual (spec §4.C): `‖q‖² − 1`, gradient `2q`.
//!
//! Built once per camera with a free quaternion; this is the soft residual
//! that lets `q` drift off the unit sphere during LM iterations (spec §3,
//! §9 "quaternion non-unit safety") rather than being clamped back to unit
//! length after every step.

use nalgebra::DVector;

use crate::project::Project;
use crate::residuals::{Coord, Row};
use crate::variables::VariableLayout;

pub fn build(layout: &VariableLayout, project: &Project, viewpoint: usize) -> Option<Row> {
    let quat_idx = layout.camera_quat_idx(viewpoint)?;
    let _ = project;
    let coords: Vec<Coord> = quat_idx.iter().map(|&i| Coord::free(i)).collect();

    Some(Row::new(coords, move |x: &DVector<f64>| {
        let q: Vec<f64> = (0..4).map(|i| x[quat_idx[i]]).collect();
        let norm2: f64 = q.iter().map(|v| v * v).sum();
        let value = norm2 - 1.0;
        let grad: Vec<f64> = q.iter().map(|v| 2.0 * v).collect();
        (value, grad)
    }))
}
