//! Angle / EqualAngles / EqualDistances residuals (spec §4.C): absolute or
//! differenced angle/distance residuals with chain-rule gradients through
//! `atan2(|cross|, dot)`.
//!
//! `EqualAngles`/`EqualDistances` are resolved (see `DESIGN.md`) as
//! differences against the *first* listed triple/pair — `residual_i =
//! f(item[i+1]) − f(item[0])` for `i` in `0..len-1` — since the spec names
//! the residual shape ("differenced") without pinning down which items are
//! compared against which.

use nalgebra::{DVector, Vector3};

use crate::geometry::skew;
use crate::project::Project;
use crate::residuals::{point_coords, Coord, Row};
use crate::variables::VariableLayout;

/// `(angle, d/d_vertex, d/d_a, d/d_b)` for the angle at `vertex` between
/// rays to `a` and `b`.
fn angle_value_and_grad(vertex: Vector3<f64>, a: Vector3<f64>, b: Vector3<f64>) -> (f64, Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    let u = a - vertex;
    let v = b - vertex;
    let c = u.cross(&v);
    let s = c.norm().max(1e-300);
    let d = u.dot(&v);
    let mag2 = (u.norm_squared() * v.norm_squared()).max(1e-300);
    let theta = s.atan2(d);

    let dtheta_du = (d / mag2) * (skew(&v) * c / s) - (s / mag2) * v;
    let dtheta_dv = (d / mag2) * (-skew(&u) * c / s) - (s / mag2) * u;

    let grad_a = dtheta_du;
    let grad_b = dtheta_dv;
    let grad_vertex = -dtheta_du - dtheta_dv;

    (theta, grad_vertex, grad_a, grad_b)
}

fn vec3_of(coords: &[Coord; 3], x: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(coords[0].value(x), coords[1].value(x), coords[2].value(x))
}

/// Absolute angle constraint: `residual = angle(vertex; a, b) − target`.
pub fn build(layout: &VariableLayout, project: &Project, vertex: usize, a: usize, b: usize, target_radians: f64) -> Row {
    let cv = point_coords(layout, project, vertex);
    let ca = point_coords(layout, project, a);
    let cb = point_coords(layout, project, b);

    let mut coords = Vec::with_capacity(9);
    coords.extend_from_slice(&cv);
    coords.extend_from_slice(&ca);
    coords.extend_from_slice(&cb);

    Row::new(coords, move |x: &DVector<f64>| {
        let (theta, gv, ga, gb) = angle_value_and_grad(vec3_of(&cv, x), vec3_of(&ca, x), vec3_of(&cb, x));
        (theta - target_radians, flatten3(gv, ga, gb))
    })
}

/// `EqualAngles`: one residual per triple after the first, each the
/// difference from the first triple's angle.
pub fn build_equal_angles(layout: &VariableLayout, project: &Project, angles: &[(usize, usize, usize)]) -> Vec<Row> {
    assert!(angles.len() >= 2, "EqualAngles needs at least two triples");
    let (v0, a0, b0) = angles[0];
    let c_v0 = point_coords(layout, project, v0);
    let c_a0 = point_coords(layout, project, a0);
    let c_b0 = point_coords(layout, project, b0);

    angles[1..]
        .iter()
        .map(|&(v, a, b)| {
            let cv = point_coords(layout, project, v);
            let ca = point_coords(layout, project, a);
            let cb = point_coords(layout, project, b);
            let (c_v0, c_a0, c_b0) = (c_v0, c_a0, c_b0);

            let mut coords = Vec::with_capacity(18);
            coords.extend_from_slice(&cv);
            coords.extend_from_slice(&ca);
            coords.extend_from_slice(&cb);
            coords.extend_from_slice(&c_v0);
            coords.extend_from_slice(&c_a0);
            coords.extend_from_slice(&c_b0);

            Row::new(coords, move |x: &DVector<f64>| {
                let (theta, gv, ga, gb) = angle_value_and_grad(vec3_of(&cv, x), vec3_of(&ca, x), vec3_of(&cb, x));
                let (theta0, gv0, ga0, gb0) = angle_value_and_grad(vec3_of(&c_v0, x), vec3_of(&c_a0, x), vec3_of(&c_b0, x));
                let mut grad = flatten3(gv, ga, gb);
                grad.extend(flatten3(-gv0, -ga0, -gb0));
                (theta - theta0, grad)
            })
        })
        .collect()
}

fn distance_value_and_grad(a: Vector3<f64>, b: Vector3<f64>) -> (f64, Vector3<f64>, Vector3<f64>) {
    let d = b - a;
    let len = d.norm().max(1e-300);
    let dir = d / len;
    (len, -dir, dir)
}

/// `EqualDistances`: one residual per pair after the first, each the
/// difference from the first pair's length.
pub fn build_equal_distances(layout: &VariableLayout, project: &Project, pairs: &[(usize, usize)]) -> Vec<Row> {
    assert!(pairs.len() >= 2, "EqualDistances needs at least two pairs");
    let (a0, b0) = pairs[0];
    let c_a0 = point_coords(layout, project, a0);
    let c_b0 = point_coords(layout, project, b0);

    pairs[1..]
        .iter()
        .map(|&(a, b)| {
            let ca = point_coords(layout, project, a);
            let cb = point_coords(layout, project, b);
            let (c_a0, c_b0) = (c_a0, c_b0);

            let mut coords = Vec::with_capacity(12);
            coords.extend_from_slice(&ca);
            coords.extend_from_slice(&cb);
            coords.extend_from_slice(&c_a0);
            coords.extend_from_slice(&c_b0);

            Row::new(coords, move |x: &DVector<f64>| {
                let (len, ga, gb) = distance_value_and_grad(vec3_of(&ca, x), vec3_of(&cb, x));
                let (len0, ga0, gb0) = distance_value_and_grad(vec3_of(&c_a0, x), vec3_of(&c_b0, x));
                let mut grad = vec![ga.x, ga.y, ga.z, gb.x, gb.y, gb.z];
                grad.extend_from_slice(&[-ga0.x, -ga0.y, -ga0.z, -gb0.x, -gb0.y, -gb0.z]);
                (len - len0, grad)
            })
        })
        .collect()
}

fn flatten3(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>) -> Vec<f64> {
    vec![a.x, a.y, a.z, b.x, b.y, b.z, c.x, c.y, c.z]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::WorldPoint;
    use crate::residuals::central_difference_gradient;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn set(layout: &VariableLayout, x: &mut DVector<f64>, id: usize, v: Vector3<f64>) {
        let idx = layout.world_point_idx(id);
        x[idx[0].unwrap()] = v.x;
        x[idx[1].unwrap()] = v.y;
        x[idx[2].unwrap()] = v.z;
    }

    #[test]
    fn right_angle_gives_zero_residual() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        set(&layout, &mut x, 0, Vector3::new(0.0, 0.0, 0.0));
        set(&layout, &mut x, 1, Vector3::new(1.0, 0.0, 0.0));
        set(&layout, &mut x, 2, Vector3::new(0.0, 1.0, 0.0));

        let row = build(&layout, &project, 0, 1, 2, FRAC_PI_2);
        assert_relative_eq!(row.residual(&x), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn angle_gradient_matches_central_difference() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        set(&layout, &mut x, 0, Vector3::new(0.1, -0.2, 0.0));
        set(&layout, &mut x, 1, Vector3::new(1.3, 0.4, -0.1));
        set(&layout, &mut x, 2, Vector3::new(0.2, 1.1, 0.3));

        let row = build(&layout, &project, 0, 1, 2, 1.0);
        let analytical = row.gradient(&x);
        let numerical = central_difference_gradient(&row, &x);
        for (a, n) in analytical.iter().zip(numerical.iter()) {
            assert_relative_eq!(a, n, epsilon = 1e-4);
        }
    }

    #[test]
    fn equal_distances_zero_for_congruent_pairs() {
        let mut project = Project::new();
        for _ in 0..4 {
            project.world_points.push(WorldPoint::free());
        }
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Never);
        let mut x = layout.initial().clone();
        set(&layout, &mut x, 0, Vector3::new(0.0, 0.0, 0.0));
        set(&layout, &mut x, 1, Vector3::new(5.0, 0.0, 0.0));
        set(&layout, &mut x, 2, Vector3::new(0.0, 0.0, 0.0));
        set(&layout, &mut x, 3, Vector3::new(0.0, 5.0, 0.0));

        let rows = build_equal_distances(&layout, &project, &[(0, 1), (2, 3)]);
        assert_relative_eq!(rows[0].residual(&x), 0.0, epsilon = 1e-9);
    }
}
