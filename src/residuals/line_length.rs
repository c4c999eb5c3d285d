//! Line-length residual (spec §4.C): `scale·(‖B−A‖ − targetLength)` with
//! `scale = 1/targetLength`.

use nalgebra::{DVector, Vector3};

use crate::project::Project;
use crate::residuals::{point_coords, Row};
use crate::variables::VariableLayout;

pub fn build(layout: &VariableLayout, project: &Project, point_a: usize, point_b: usize, target_length: f64) -> Row {
    let a = point_coords(layout, project, point_a);
    let b = point_coords(layout, project, point_b);
    let scale = 1.0 / target_length;

    let mut coords = Vec::with_capacity(6);
    coords.extend_from_slice(&a);
    coords.extend_from_slice(&b);

    Row::new(coords, move |x: &DVector<f64>| {
        let pa = Vector3::new(a[0].value(x), a[1].value(x), a[2].value(x));
        let pb = Vector3::new(b[0].value(x), b[1].value(x), b[2].value(x));
        let d = pb - pa;
        let len = d.norm();
        let value = scale * (len - target_length);
        let dir = if len > 1e-12 { d / len } else { Vector3::zeros() };
        let grad_a = -scale * dir;
        let grad_b = scale * dir;
        (
            value,
            vec![grad_a.x, grad_a.y, grad_a.z, grad_b.x, grad_b.y, grad_b.z],
        )
    })
}
