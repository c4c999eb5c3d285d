//! Coplanar residual (spec §4.C): `N − 3` residuals for `N ≥ 4` points.
//! Residual `i` is the signed point-to-plane distance of `points[i+3]` from
//! the plane through `(points[i], points[i+1], points[i+2])`, with the
//! plane normal `(p1 − p0) × (p2 − p0)` normalized. This is the
//! "rotating base" variant named in spec §9's open question — the *only*
//! coplanarity provider this crate implements, since the spec explicitly
//! excludes the alternate "all combinations against one base triangle"
//! version the source mixed in under the same name.

use nalgebra::{DVector, Matrix3, Vector3};

use crate::geometry::skew;
use crate::project::Project;
use crate::residuals::{point_coords, Coord, Row};
use crate::variables::VariableLayout;

pub fn build(layout: &VariableLayout, project: &Project, points: &[usize]) -> Vec<Row> {
    assert!(points.len() >= 4, "coplanar needs at least 4 points");
    let coords: Vec<[Coord; 3]> = points.iter().map(|&id| point_coords(layout, project, id)).collect();

    (0..points.len() - 3)
        .map(|i| {
            let p0 = coords[i];
            let p1 = coords[i + 1];
            let p2 = coords[i + 2];
            let p3 = coords[i + 3];

            let mut row_coords = Vec::with_capacity(12);
            row_coords.extend_from_slice(&p0);
            row_coords.extend_from_slice(&p1);
            row_coords.extend_from_slice(&p2);
            row_coords.extend_from_slice(&p3);

            Row::new(row_coords, move |x: &DVector<f64>| {
                let v0 = Vector3::new(p0[0].value(x), p0[1].value(x), p0[2].value(x));
                let v1 = Vector3::new(p1[0].value(x), p1[1].value(x), p1[2].value(x));
                let v2 = Vector3::new(p2[0].value(x), p2[1].value(x), p2[2].value(x));
                let v3 = Vector3::new(p3[0].value(x), p3[1].value(x), p3[2].value(x));

                let e1 = v1 - v0;
                let e2 = v2 - v0;
                let n_raw = e1.cross(&e2);
                let n_raw_norm = n_raw.norm();
                let n = n_raw / n_raw_norm;
                let d = v3 - v0;
                let residual = d.dot(&n);

                let projection: Matrix3<f64> = Matrix3::identity() - n * n.transpose();
                let skew_e1 = skew(&e1);
                let skew_e2 = skew(&e2);

                let dn_dp0 = projection * (skew_e2 - skew_e1) / n_raw_norm;
                let dn_dp1 = projection * (-skew_e2) / n_raw_norm;
                let dn_dp2 = projection * skew_e1 / n_raw_norm;

                let grad_p0 = -n + dn_dp0.transpose() * d;
                let grad_p1 = dn_dp1.transpose() * d;
                let grad_p2 = dn_dp2.transpose() * d;
                let grad_p3 = n;

                let mut full = Vec::with_capacity(12);
                full.extend_from_slice(&[grad_p0.x, grad_p0.y, grad_p0.z]);
                full.extend_from_slice(&[grad_p1.x, grad_p1.y, grad_p1.z]);
                full.extend_from_slice(&[grad_p2.x, grad_p2.y, grad_p2.z]);
                full.extend_from_slice(&[grad_p3.x, grad_p3.y, grad_p3.z]);

                (residual, full)
            })
        })
        .collect()
}
