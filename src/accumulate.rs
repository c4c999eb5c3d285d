//! Normal-equation accumulator (spec §4.D).
//!
//! Iterates the provider (row) set once per LM iteration and sums:
//! `cost += r²`, `negJtr[i] += −g[k]·r`, `JtJ[i,j] += g[k]·g[m]` for every
//! pair of free indices a row touches (spec: "emit both triangles"). The
//! dense `M×N` Jacobian the spec forbids materializing never exists here —
//! only each row's small gradient block is ever held in memory at once.
//! Complexity is `O(M·k²)` for `M` rows and `k` = max row fan-in.

use nalgebra::DVector;

use crate::linalg::NormalMatrix;
use crate::residuals::Row;

/// `{JtJ, negJtr, cost, residuals}` — the output of one accumulation pass,
/// consumed by the LM driver (spec §4.D).
pub struct NormalEquations {
    pub jtj: NormalMatrix,
    pub neg_jtr: DVector<f64>,
    pub cost: f64,
    pub residuals: Vec<f64>,
}

/// Accumulate normal equations over `rows` at `x`. Row emission order is
/// exactly `rows`' order and summation within a row's gradient block is in
/// the order the block was built, matching spec §9's "deterministic
/// summation — do not sort triplets by value."
pub fn accumulate(n: usize, rows: &[Row], x: &DVector<f64>) -> NormalEquations {
    let mut jtj = NormalMatrix::zeros(n);
    let mut neg_jtr = DVector::zeros(n);
    let mut cost = 0.0;
    let mut residuals = Vec::with_capacity(rows.len());

    for row in rows {
        let (r, grad) = row.eval(x);
        let idx = row.variable_indices();
        cost += r * r;
        residuals.push(r);

        for (k, &i) in idx.iter().enumerate() {
            neg_jtr[i] += -grad[k] * r;
            for (m, &j) in idx.iter().enumerate() {
                jtj.add(i, j, grad[k] * grad[m]);
            }
        }
    }

    NormalEquations { jtj, neg_jtr, cost, residuals }
}

/// Cost only (no gradient accumulation), used by the LM driver to test
/// whether a candidate step should be accepted without rebuilding `JtJ`.
pub fn cost_only(rows: &[Row], x: &DVector<f64>) -> f64 {
    rows.iter().map(|row| {
        let r = row.residual(x);
        r * r
    }).sum()
}
