//! Symmetric linear system assembly and solve (spec §4.A).
//!
//! The spec's "sparse matrix from triplets" becomes a dense `N×N`
//! `nalgebra::DMatrix<f64>` here rather than a true sparse structure — see
//! `SPEC_FULL.md` §4.A/D for why: `N` is the variable count (small, tens to
//! low thousands), and no sparse-factorization crate appears anywhere in the
//! retrieved corpus. The object the spec actually forbids materializing is
//! the dense `M×N` Jacobian (`M` = observation count), which never exists as
//! a value in this crate at all.

use nalgebra::{Cholesky, DMatrix, DVector};

/// The symmetric `JtJ` accumulator, built by repeatedly calling [`Self::add`]
/// with `(row, col, value)` triplets (spec §4.A "summing duplicates").
#[derive(Debug, Clone)]
pub struct NormalMatrix {
    n: usize,
    data: DMatrix<f64>,
}

impl NormalMatrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: DMatrix::zeros(n, n),
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Add `value` into `(row, col)`. Callers emit both `(i, j)` and `(j, i)`
    /// explicitly (spec §4.D) rather than relying on this to mirror, so that
    /// summation order stays exactly the order providers emit gradient pairs
    /// in (spec §9 "deterministic summation").
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.data[(row, col)] += value;
    }

    pub fn diagonal(&self) -> DVector<f64> {
        self.data.diagonal()
    }

    /// Marquardt-scaled damping: `A = JtJ + diag(lambda_vec)`, where the
    /// caller has already multiplied `lambda` by `diag(JtJ)` (or passed a
    /// uniform vector) per spec §4.E step 2.
    pub fn add_diagonal(&self, lambda_vec: &DVector<f64>) -> DMatrix<f64> {
        let mut a = self.data.clone();
        for i in 0..self.n {
            a[(i, i)] += lambda_vec[i];
        }
        a
    }

    pub fn as_dense(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Symmetry check used by the test in spec §8 ("`JtJ[i,j] == JtJ[j,i]`
    /// to within 1e-12").
    #[cfg(test)]
    fn max_asymmetry(&self) -> f64 {
        let mut worst = 0.0f64;
        for i in 0..self.n {
            for j in 0..self.n {
                worst = worst.max((self.data[(i, j)] - self.data[(j, i)]).abs());
            }
        }
        worst
    }
}

/// Attempt a Cholesky solve of `a x = rhs`; on failure (not positive
/// definite) fall back to Jacobi-preconditioned conjugate gradients, per
/// spec §4.A. `None` signals rank deficiency to the LM driver.
pub fn solve_spd(a: &DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = Cholesky::new(a.clone()) {
        return Some(chol.solve(rhs));
    }
    conjugate_gradient(a, rhs, 1e-8, 10 * a.nrows())
}

/// Jacobi-preconditioned conjugate gradients for a symmetric (not
/// necessarily PD) system, used as the fallback solver of spec §4.A.
pub fn conjugate_gradient(a: &DMatrix<f64>, rhs: &DVector<f64>, tol: f64, max_iter: usize) -> Option<DVector<f64>> {
    let n = a.nrows();
    if n == 0 {
        return Some(DVector::zeros(0));
    }
    let precond: DVector<f64> = a.diagonal().map(|d| if d.abs() > 1e-300 { 1.0 / d } else { 1.0 });

    let mut x = DVector::zeros(n);
    let mut r = rhs.clone();
    let rhs_norm = rhs.norm().max(1e-300);
    if r.norm() / rhs_norm < tol {
        return Some(x);
    }
    let mut z = precond.component_mul(&r);
    let mut p = z.clone();
    let mut rz_old = r.dot(&z);

    for _ in 0..max_iter {
        let ap = a * &p;
        let denom = p.dot(&ap);
        if !denom.is_finite() || denom.abs() < 1e-300 {
            return None;
        }
        let alpha = rz_old / denom;
        if !alpha.is_finite() {
            return None;
        }
        x += alpha * &p;
        r -= alpha * &ap;
        if r.norm() / rhs_norm < tol {
            return Some(x);
        }
        z = precond.component_mul(&r);
        let rz_new = r.dot(&z);
        let beta = rz_new / rz_old;
        if !beta.is_finite() {
            return None;
        }
        p = &z + beta * &p;
        rz_old = rz_new;
    }
    None
}
