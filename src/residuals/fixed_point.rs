//! Fixed-point constraint residual (spec §4.C): up to three residuals
//! `coord − target` with unit gradient, emitted only for free axes.
//!
//! Distinct from [`crate::project::WorldPoint::locked_xyz`], which removes
//! an axis from the variable layout entirely — this is
//! [`crate::project::Constraint::FixedPoint`], a *soft* target applied as an
//! ordinary residual, used when the caller wants to pull a point toward a
//! value without hard-locking it.

use nalgebra::DVector;

use crate::project::Project;
use crate::residuals::{Coord, Row};
use crate::variables::VariableLayout;

pub fn build(layout: &VariableLayout, project: &Project, point: usize, target: [Option<f64>; 3]) -> Vec<Row> {
    let idx = layout.world_point_idx(point);
    let _ = project;
    let mut rows = Vec::new();
    for axis in 0..3 {
        let (Some(t), Some(i)) = (target[axis], idx[axis]) else {
            continue;
        };
        let coords = vec![Coord::free(i)];
        rows.push(Row::new(coords, move |x: &DVector<f64>| (x[i] - t, vec![1.0])));
    }
    rows
}
