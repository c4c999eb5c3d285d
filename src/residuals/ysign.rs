//! Y-sign preservation residual (spec §4.C, §9 "reflected-minimum
//! attractors"): breaks the well-known local minimum where the scene
//! reflects across the ground plane, by penalizing a camera's Y position
//! flipping sign relative to its initial estimate.
//!
//! Disabled by default (spec §4.C); callers enable it per camera when the
//! initial `|y|` exceeds a threshold.

use nalgebra::DVector;

use crate::project::Project;
use crate::residuals::{Coord, Row};
use crate::variables::VariableLayout;

/// Builds the residual for `viewpoint` if its camera position is free and
/// its initial `|y|` exceeds `threshold`; otherwise returns `None`.
pub fn build(layout: &VariableLayout, project: &Project, viewpoint: usize, weight: f64, threshold: f64) -> Option<Row> {
    let y_idx = layout.camera_pos_idx(viewpoint)[1]?;
    let initial_y = project.viewpoints[viewpoint].pose.position.y;
    if initial_y.abs() <= threshold {
        return None;
    }
    let initial_sign = initial_y.signum();

    Some(Row::new(vec![Coord::free(y_idx)], move |x: &DVector<f64>| {
        let y = x[y_idx];
        if y == 0.0 || y.signum() == initial_sign {
            (0.0, vec![0.0])
        } else {
            (weight * y.abs(), vec![weight * y.signum()])
        }
    }))
}
