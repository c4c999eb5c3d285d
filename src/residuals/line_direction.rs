//! Line-direction (axis-alignment) residual (spec §4.C): two residuals when
//! constraining to an axis (the two perpendicular components of `B − A`),
//! one residual when constraining to a plane (the single component normal
//! to that plane).

use nalgebra::DVector;

use crate::project::{Axis, LineDirectionConstraint, Project};
use crate::residuals::{point_coords, Row};
use crate::variables::VariableLayout;

fn component_row(a: [crate::residuals::Coord; 3], b: [crate::residuals::Coord; 3], axis: usize) -> Row {
    let coords = vec![a[axis], b[axis]];
    Row::new(coords, move |x: &DVector<f64>| {
        let value = b[axis].value(x) - a[axis].value(x);
        (value, vec![-1.0, 1.0])
    })
}

pub fn build(layout: &VariableLayout, project: &Project, point_a: usize, point_b: usize, direction: LineDirectionConstraint) -> Vec<Row> {
    let a = point_coords(layout, project, point_a);
    let b = point_coords(layout, project, point_b);

    let axes: Vec<usize> = match direction {
        LineDirectionConstraint::Axis(axis) => (0..3).filter(|&i| i != axis.index()).collect(),
        LineDirectionConstraint::Plane(ax1, ax2) => (0..3).filter(|&i| i != ax1.index() && i != ax2.index()).collect(),
        LineDirectionConstraint::Free => Vec::new(),
    };

    axes.into_iter().map(|axis| component_row(a, b, axis)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::WorldPoint;
    use crate::residuals::central_difference_gradient;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;

    #[test]
    fn axis_constraint_emits_two_perpendicular_rows() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        let a_idx = layout.world_point_idx(0);
        let b_idx = layout.world_point_idx(1);
        x[a_idx[0].unwrap()] = 0.0;
        x[a_idx[1].unwrap()] = 0.0;
        x[a_idx[2].unwrap()] = 0.0;
        x[b_idx[0].unwrap()] = 5.0;
        x[b_idx[1].unwrap()] = 0.1;
        x[b_idx[2].unwrap()] = -0.2;

        let rows = build(&layout, &project, 0, 1, LineDirectionConstraint::Axis(Axis::X));
        assert_eq!(rows.len(), 2);
        assert_relative_eq!(rows[0].residual(&x), 0.1, epsilon = 1e-9);
        assert_relative_eq!(rows[1].residual(&x), -0.2, epsilon = 1e-9);
        for row in &rows {
            let analytical = row.gradient(&x);
            let numerical = central_difference_gradient(row, &x);
            for (av, nv) in analytical.iter().zip(numerical.iter()) {
                assert_relative_eq!(av, nv, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn plane_constraint_emits_one_row() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let rows = build(&layout, &project, 0, 1, LineDirectionConstraint::Plane(Axis::X, Axis::Y));
        assert_eq!(rows.len(), 1);
    }
}
