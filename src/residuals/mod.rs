//! Residual providers (spec §4.C).
//!
//! A provider is a row of the (never-materialized) Jacobian: a scalar
//! function of the current variable vector `x`, the indices of the `x`
//! entries it depends on, and the analytic gradient over exactly those
//! indices. Locked/inferred coordinates are inlined as constants at
//! construction time rather than appearing in `variable_indices` (spec §3
//! "a locked coordinate never appears as a free variable").
//!
//! Every family below is built the same way: gather the handful of
//! [`Coord`] slots (free-or-locked scalars) the residual touches, then
//! capture a closure computing `(value, full_gradient)` over those slots.
//! [`Row`] is the one concrete type implementing [`ResidualRow`]; families
//! differ only in which closure they build, matching spec §9's "tagged
//! variants over a capability set, dispatched at construction time, no
//! virtual calls in the inner loop" — the inner loop here is a closure call,
//! not a dynamic dispatch through a trait object hierarchy of constraint
//! kinds.

use std::sync::Arc;

use nalgebra::DVector;

pub mod angle;
pub mod coincident;
pub mod collinear;
pub mod coplanar;
pub mod fixed_point;
pub mod focal_reg;
pub mod line_direction;
pub mod line_length;
pub mod point_reg;
pub mod quat_norm;
pub mod reprojection;
pub mod vanishing;
pub mod ysign;

/// A single scalar slot: either a free variable (index into `x`) or a
/// constant inlined from a locked/fixed entity field.
#[derive(Debug, Clone, Copy)]
pub struct Coord {
    pub idx: Option<usize>,
    pub locked: f64,
}

impl Coord {
    pub fn free(idx: usize) -> Self {
        Self { idx: Some(idx), locked: 0.0 }
    }

    pub fn fixed(value: f64) -> Self {
        Self { idx: None, locked: value }
    }

    pub fn value(&self, x: &DVector<f64>) -> f64 {
        match self.idx {
            Some(i) => x[i],
            None => self.locked,
        }
    }
}

/// Spec §4.C's provider capability set, expressed as a trait so the
/// accumulator ([`crate::accumulate`]) can hold a homogeneous
/// `Vec<Box<dyn ResidualRow>>` or (when constructing its own rows directly)
/// a `Vec<Row>`.
pub trait ResidualRow {
    fn variable_indices(&self) -> &[usize];
    fn residual(&self, x: &DVector<f64>) -> f64;
    fn gradient(&self, x: &DVector<f64>) -> Vec<f64>;
}

/// The one concrete provider type. `eval` returns `(value, full_gradient)`
/// over *all* of `coords` (including the locked ones, whose gradient entries
/// are simply never read); `variable_indices`/`gradient` filter down to the
/// free subset.
#[derive(Clone)]
pub struct Row {
    coords: Vec<Coord>,
    free_indices: Vec<usize>,
    eval: Arc<dyn Fn(&DVector<f64>) -> (f64, Vec<f64>) + Send + Sync>,
}

impl Row {
    pub fn new<F>(coords: Vec<Coord>, eval: F) -> Self
    where
        F: Fn(&DVector<f64>) -> (f64, Vec<f64>) + Send + Sync + 'static,
    {
        let free_indices = coords.iter().filter_map(|c| c.idx).collect();
        Self {
            coords,
            free_indices,
            eval: Arc::new(eval),
        }
    }

    /// Combined value+gradient evaluation, used by [`crate::accumulate`] to
    /// avoid evaluating the closure twice per row.
    pub fn eval(&self, x: &DVector<f64>) -> (f64, Vec<f64>) {
        let (value, full_grad) = (self.eval)(x);
        let grad = self
            .coords
            .iter()
            .zip(full_grad.iter())
            .filter_map(|(c, g)| c.idx.map(|_| *g))
            .collect();
        (value, grad)
    }
}

impl ResidualRow for Row {
    fn variable_indices(&self) -> &[usize] {
        &self.free_indices
    }

    fn residual(&self, x: &DVector<f64>) -> f64 {
        self.eval(x).0
    }

    fn gradient(&self, x: &DVector<f64>) -> Vec<f64> {
        self.eval(x).1
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row").field("coords", &self.coords).finish_non_exhaustive()
    }
}

/// Gather the three per-axis [`Coord`] slots for a world point: free
/// variable if the axis is unconstrained, else the locked/inferred value
/// inlined as a constant. Shared by every family that touches raw point
/// positions (line length/direction, collinear, coincident, coplanar,
/// angle, point regularization).
pub(crate) fn point_coords(
    layout: &crate::variables::VariableLayout,
    project: &crate::project::Project,
    point: usize,
) -> [Coord; 3] {
    let idx = layout.world_point_idx(point);
    let mut coords = [Coord::fixed(0.0); 3];
    for axis in 0..3 {
        coords[axis] = match idx[axis] {
            Some(i) => Coord::free(i),
            None => Coord::fixed(layout.locked_value(project, point, axis)),
        };
    }
    coords
}

/// Shared central-difference helper used by every family's unit tests to
/// satisfy the correctness contract of spec §8.
#[cfg(test)]
pub(crate) fn central_difference_gradient(row: &Row, x: &DVector<f64>) -> Vec<f64> {
    let eps = 1e-6;
    row.variable_indices()
        .iter()
        .map(|&i| {
            let mut xp = x.clone();
            xp[i] += eps;
            let mut xm = x.clone();
            xm[i] -= eps;
            (row.residual(&xp) - row.residual(&xm)) / (2.0 * eps)
        })
        .collect()
}
