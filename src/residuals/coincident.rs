//! Coincident-point residual (spec §4.C): three residuals, the X/Y/Z
//! components of `(P − A) × (B − A) / scale`, where `P` should lie on line
//! `A–B`.
//!
//! The spec names a `scale` factor without defining it; this crate resolves
//! it (see `DESIGN.md`) as the line's length at construction time — a fixed
//! constant captured once, exactly as [`crate::residuals::line_length`]'s
//! `scale = 1/targetLength` is a fixed constant rather than something
//! differentiated through.

use nalgebra::{DVector, Matrix3, Vector3};

use crate::geometry::skew;
use crate::project::Project;
use crate::residuals::{point_coords, Row};
use crate::variables::VariableLayout;

pub fn build(layout: &VariableLayout, project: &Project, point: usize, a: usize, b: usize) -> Vec<Row> {
    let p = point_coords(layout, project, point);
    let pa = point_coords(layout, project, a);
    let pb = point_coords(layout, project, b);

    let scale = {
        let a_pos = project.world_points[a].effective_point().unwrap_or_else(Vector3::zeros);
        let b_pos = project.world_points[b].effective_point().unwrap_or_else(Vector3::zeros);
        let len = (b_pos - a_pos).norm();
        if len > 1e-9 {
            len
        } else {
            1.0
        }
    };

    (0..3)
        .map(|component| {
            let mut coords = Vec::with_capacity(9);
            coords.extend_from_slice(&p);
            coords.extend_from_slice(&pa);
            coords.extend_from_slice(&pb);

            Row::new(coords, move |x: &DVector<f64>| {
                let pp = Vector3::new(p[0].value(x), p[1].value(x), p[2].value(x));
                let ppa = Vector3::new(pa[0].value(x), pa[1].value(x), pa[2].value(x));
                let ppb = Vector3::new(pb[0].value(x), pb[1].value(x), pb[2].value(x));

                let u = pp - ppa;
                let v = ppb - ppa;
                let cross = u.cross(&v);

                let skew_u = skew(&u);
                let skew_v = skew(&v);
                let d_dp = -skew_v;
                let d_da = skew_v - skew_u;
                let d_db = skew_u;

                let mut full = vec![0.0; 9];
                write_row(&mut full, 0, &d_dp, component, scale);
                write_row(&mut full, 3, &d_da, component, scale);
                write_row(&mut full, 6, &d_db, component, scale);

                (cross[component] / scale, full)
            })
        })
        .collect()
}

fn write_row(full: &mut [f64], offset: usize, m: &Matrix3<f64>, row: usize, scale: f64) {
    for col in 0..3 {
        full[offset + col] = m[(row, col)] / scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::WorldPoint;
    use crate::residuals::central_difference_gradient;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;

    fn set(layout: &VariableLayout, x: &mut DVector<f64>, id: usize, v: Vector3<f64>) {
        let idx = layout.world_point_idx(id);
        x[idx[0].unwrap()] = v.x;
        x[idx[1].unwrap()] = v.y;
        x[idx[2].unwrap()] = v.z;
    }

    #[test]
    fn point_on_line_gives_zero_residual() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
        project.world_points.push(WorldPoint::locked([10.0, 0.0, 0.0]));
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        set(&layout, &mut x, 2, Vector3::new(5.0, 0.0, 0.0));

        let rows = build(&layout, &project, 2, 0, 1);
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
        set(&layout, &mut x, 0, Vector3::new(1.0, 2.0, 0.3));
        set(&layout, &mut x, 1, Vector3::new(0.0, 0.0, 0.0));
        set(&layout, &mut x, 2, Vector3::new(10.0, 0.0, 0.0));

        let rows = build(&layout, &project, 0, 1, 2);
        for row in &rows {
            let analytical = row.gradient(&x);
            let numerical = central_difference_gradient(row, &x);
            for (a, n) in analytical.iter().zip(numerical.iter()) {
                assert_relative_eq!(a, n, epsilon = 1e-5);
            }
        }
    }
}
