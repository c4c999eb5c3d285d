//! Collinear residual (spec §4.C): three residuals, the X/Y/Z components of
//! `(p1 − p0) × (p2 − p0)`.

use nalgebra::{DVector, Matrix3, Vector3};

use crate::geometry::skew;
use crate::project::Project;
use crate::residuals::{point_coords, Row};
use crate::variables::VariableLayout;

pub fn build(layout: &VariableLayout, project: &Project, points: [usize; 3]) -> Vec<Row> {
    let p = points.map(|id| point_coords(layout, project, id));

    (0..3)
        .map(|component| {
            let p = p;
            let mut coords = Vec::with_capacity(9);
            for pt in &p {
                coords.extend_from_slice(pt);
            }
            Row::new(coords, move |x: &DVector<f64>| {
                let pos: [Vector3<f64>; 3] = p.map(|pt| Vector3::new(pt[0].value(x), pt[1].value(x), pt[2].value(x)));
                let u = pos[1] - pos[0];
                let v = pos[2] - pos[0];
                let cross = u.cross(&v);

                let skew_u = skew(&u);
                let skew_v = skew(&v);
                let d_dp0 = skew_v - skew_u;
                let d_dp1 = -skew_v;
                let d_dp2 = skew_u;

                let mut full = vec![0.0; 9];
                write_row(&mut full, 0, &d_dp0, component);
                write_row(&mut full, 3, &d_dp1, component);
                write_row(&mut full, 6, &d_dp2, component);

                (cross[component], full)
            })
        })
        .collect()
}

fn write_row(full: &mut [f64], offset: usize, m: &Matrix3<f64>, row: usize) {
    for col in 0..3 {
        full[offset + col] = m[(row, col)];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::WorldPoint;
    use crate::residuals::central_difference_gradient;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;

    #[test]
    fn collinear_points_give_zero_residual() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        let set = |x: &mut DVector<f64>, id: usize, v: Vector3<f64>| {
            let idx = layout.world_point_idx(id);
            x[idx[0].unwrap()] = v.x;
            x[idx[1].unwrap()] = v.y;
            x[idx[2].unwrap()] = v.z;
        };
        set(&mut x, 0, Vector3::new(0.0, 0.0, 0.0));
        set(&mut x, 1, Vector3::new(1.0, 1.0, 1.0));
        set(&mut x, 2, Vector3::new(2.0, 2.0, 2.0));

        let rows = build(&layout, &project, [0, 1, 2]);
        for row in &rows {
            assert_relative_eq!(row.residual(&x), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn gradient_matches_central_difference() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        let set = |x: &mut DVector<f64>, id: usize, v: Vector3<f64>| {
            let idx = layout.world_point_idx(id);
            x[idx[0].unwrap()] = v.x;
            x[idx[1].unwrap()] = v.y;
            x[idx[2].unwrap()] = v.z;
        };
        set(&mut x, 0, Vector3::new(0.0, 0.0, 0.0));
        set(&mut x, 1, Vector3::new(1.0, 1.3, 0.7));
        set(&mut x, 2, Vector3::new(-0.4, 2.0, 1.1));

        let rows = build(&layout, &project, [0, 1, 2]);
        for row in &rows {
            let analytical = row.gradient(&x);
            let numerical = central_difference_gradient(row, &x);
            for (a, n) in analytical.iter().zip(numerical.iter()) {
                assert_relative_eq!(a, n, epsilon = 1e-5);
            }
        }
    }
}
