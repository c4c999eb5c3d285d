//! Point-position regularization residual (spec §4.C): `w·(coord − initial)`
//! per free axis, for points with a valid initial estimate — prevents
//! weakly-constrained points from drifting unboundedly during early
//! iterations.
//!
//! The spec does not pin a numeric weight for this family (unlike focal-length
//! regularization's `w=500`); this crate uses a small fixed `WEIGHT` (see
//! `DESIGN.md`) chosen to be negligible once a point is well constrained by
//! reprojection observations, but enough to damp divergence before then.

use nalgebra::DVector;

use crate::project::Project;
use crate::residuals::{Coord, Row};
use crate::variables::VariableLayout;

const WEIGHT: f64 = 1e-3;

/// Returns one row per free axis that has a valid initial estimate; `None`
/// if the point has no initial estimate at all (nothing to regularize
/// toward).
pub fn build(layout: &VariableLayout, project: &Project, point: usize) -> Vec<Row> {
    let Some(initial) = project.world_points[point].optimized_xyz else {
        return Vec::new();
    };
    let idx = layout.world_point_idx(point);

    (0..3)
        .filter_map(|axis| {
            let i = idx[axis]?;
            let target = initial[axis];
            Some(Row::new(vec![Coord::free(i)], move |x: &DVector<f64>| {
                (WEIGHT * (x[i] - target), vec![WEIGHT])
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::WorldPoint;
    use crate::residuals::ResidualRow;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;

    #[test]
    fn no_rows_without_initial_estimate() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        assert!(build(&layout, &project, 0).is_empty());
    }

    #[test]
    fn residual_zero_at_initial_value() {
        let mut project = Project::new();
        let mut wp = WorldPoint::free();
        wp.optimized_xyz = Some([1.0, 2.0, 3.0]);
        project.world_points.push(wp);
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let x = layout.initial().clone();
        let rows = build(&layout, &project, 0);
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_relative_eq!(row.residual(&x), 0.0, epsilon = 1e-12);
            assert_eq!(row.variable_indices().len(), 1);
        }
    }
}
