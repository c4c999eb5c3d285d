//! Quaternion rotation, projection, and intrinsics primitives (spec §4.K).
//!
//! Every rotation here uses the general Hamilton formula rather than the
//! `UnitQuaternion` shortcut nalgebra/cam_geom provide, because the soft
//! normalization residual (see [`crate::residuals::quat_norm`]) lets `q`
//! drift away from unit length during Levenberg–Marquardt iterations (spec
//! §3, §9 "Quaternion non-unit safety").

use nalgebra::{Matrix3, Matrix3x4, Vector3, Vector4};

/// Rotate `t` by quaternion `q = [w, x, y, z]` using the general (non-unit-safe)
/// Hamilton formula:
///
/// `v' = 2(qv·t)qv + (w² − |qv|²)t + 2w(qv × t)`
pub fn quat_rotate(q: &Vector4<f64>, t: &Vector3<f64>) -> Vector3<f64> {
    quat_to_matrix(q) * t
}

/// The 3x3 linear map `t -> quat_rotate(q, t)`, valid for non-unit `q`.
///
/// `M(q) = (w² − |qv|²) I + 2 qv qvᵀ + 2w [qv]_x`
pub fn quat_to_matrix(q: &Vector4<f64>) -> Matrix3<f64> {
    let w = q[0];
    let qv = Vector3::new(q[1], q[2], q[3]);
    let n2 = qv.dot(&qv);
    let skew = Matrix3::new(0.0, -qv.z, qv.y, qv.z, 0.0, -qv.x, -qv.y, qv.x, 0.0);
    Matrix3::identity() * (w * w - n2) + 2.0 * qv * qv.transpose() + 2.0 * w * skew
}

/// The skew-symmetric cross-product matrix `[v]_x` such that `[v]_x w = v × w`.
/// Shared by the collinear/coincident/coplanar residual families, whose
/// gradients are all cross-product derivatives.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Hamilton product `q1 * q2`, both as `[w, x, y, z]`.
pub fn quat_multiply(q1: &Vector4<f64>, q2: &Vector4<f64>) -> Vector4<f64> {
    let (w1, x1, y1, z1) = (q1[0], q1[1], q1[2], q1[3]);
    let (w2, x2, y2, z2) = (q2[0], q2[1], q2[2], q2[3]);
    Vector4::new(
        w1 * w2 - x1 * x2 - y1 * y2 - z1 * z2,
        w1 * x2 + x1 * w2 + y1 * z2 - z1 * y2,
        w1 * y2 - x1 * z2 + y1 * w2 + z1 * x2,
        w1 * z2 + x1 * y2 - y1 * x2 + z1 * w2,
    )
}

/// Conjugate (= inverse up to scale) of `q`.
pub fn quat_conjugate(q: &Vector4<f64>) -> Vector4<f64> {
    Vector4::new(q[0], -q[1], -q[2], -q[3])
}

/// `v'` together with `d(v')/dq`, a 3x4 matrix whose columns are
/// `[∂v'/∂w, ∂v'/∂x, ∂v'/∂y, ∂v'/∂z]`, evaluated at fixed `t`.
///
/// Derived directly from the Hamilton formula above (see `DESIGN.md` for the
/// derivation): with `s = qv·t`, `cross = qv × t`,
///
/// ```text
/// ∂v'/∂w = 2w t + 2 cross
/// ∂v'/∂x = 2 tx qv + 2 s e_x − 2x t + 2w (0, −tz, ty)
/// ∂v'/∂y = 2 ty qv + 2 s e_y − 2y t + 2w (tz, 0, −tx)
/// ∂v'/∂z = 2 tz qv + 2 s e_z − 2z t + 2w (−ty, tx, 0)
/// ```
pub fn quat_rotate_with_jacobian(q: &Vector4<f64>, t: &Vector3<f64>) -> (Vector3<f64>, Matrix3x4<f64>) {
    let w = q[0];
    let qv = Vector3::new(q[1], q[2], q[3]);
    let (x, y, z) = (qv.x, qv.y, qv.z);
    let n2 = qv.dot(&qv);
    let s = qv.dot(t);
    let cross = qv.cross(t);

    let v = 2.0 * s * qv + (w * w - n2) * t + 2.0 * w * cross;

    let dv_dw = 2.0 * w * t + 2.0 * cross;
    let dv_dx = 2.0 * t.x * qv + 2.0 * s * Vector3::x() - 2.0 * x * t
        + 2.0 * w * Vector3::new(0.0, -t.z, t.y);
    let dv_dy = 2.0 * t.y * qv + 2.0 * s * Vector3::y() - 2.0 * y * t
        + 2.0 * w * Vector3::new(t.z, 0.0, -t.x);
    let dv_dz = 2.0 * t.z * qv + 2.0 * s * Vector3::z() - 2.0 * z * t
        + 2.0 * w * Vector3::new(-t.y, t.x, 0.0);

    let mut jac = Matrix3x4::zeros();
    jac.set_column(0, &dv_dw);
    jac.set_column(1, &dv_dx);
    jac.set_column(2, &dv_dy);
    jac.set_column(3, &dv_dz);

    (v, jac)
}

/// Shepperd's method: extract a unit quaternion `[w, x, y, z]` from a
/// rotation matrix. Used by the camera initializers and scene alignment,
/// which work with rotation matrices internally and hand the result back as
/// the `[w, x, y, z]` pose representation this crate uses everywhere else.
pub fn quat_from_rotation_matrix(r: &Matrix3<f64>) -> Vector4<f64> {
    let trace = r.trace();
    if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        Vector4::new(0.25 * s, (r[(2, 1)] - r[(1, 2)]) / s, (r[(0, 2)] - r[(2, 0)]) / s, (r[(1, 0)] - r[(0, 1)]) / s)
    } else if r[(0, 0)] > r[(1, 1)] && r[(0, 0)] > r[(2, 2)] {
        let s = (1.0 + r[(0, 0)] - r[(1, 1)] - r[(2, 2)]).sqrt() * 2.0;
        Vector4::new((r[(2, 1)] - r[(1, 2)]) / s, 0.25 * s, (r[(0, 1)] + r[(1, 0)]) / s, (r[(0, 2)] + r[(2, 0)]) / s)
    } else if r[(1, 1)] > r[(2, 2)] {
        let s = (1.0 + r[(1, 1)] - r[(0, 0)] - r[(2, 2)]).sqrt() * 2.0;
        Vector4::new((r[(0, 2)] - r[(2, 0)]) / s, (r[(0, 1)] + r[(1, 0)]) / s, 0.25 * s, (r[(1, 2)] + r[(2, 1)]) / s)
    } else {
        let s = (1.0 + r[(2, 2)] - r[(0, 0)] - r[(1, 1)]).sqrt() * 2.0;
        Vector4::new((r[(1, 0)] - r[(0, 1)]) / s, (r[(0, 2)] + r[(2, 0)]) / s, (r[(1, 2)] + r[(2, 1)]) / s, 0.25 * s)
    }
}

/// Brown-Conrady (OpenCV) radial + tangential distortion coefficients.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

/// Result of applying [`Distortion`] to normalized camera-plane coordinates,
/// together with the Jacobian of `(xd, yd)` with respect to `(xn, yn)`.
pub struct DistortResult {
    pub xd: f64,
    pub yd: f64,
    /// `[[dxd/dxn, dxd/dyn], [dyd/dxn, dyd/dyn]]`
    pub jac: [[f64; 2]; 2],
}

impl Distortion {
    /// Apply the distortion model to normalized coordinates `(xn, yn)`.
    pub fn apply(&self, xn: f64, yn: f64) -> DistortResult {
        let r2 = xn * xn + yn * yn;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let drad_dr2 = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r2 * r2;

        let xd = xn * radial + 2.0 * self.p1 * xn * yn + self.p2 * (r2 + 2.0 * xn * xn);
        let yd = yn * radial + self.p1 * (r2 + 2.0 * yn * yn) + 2.0 * self.p2 * xn * yn;

        let dxd_dxn = radial + 2.0 * xn * xn * drad_dr2 + 2.0 * self.p1 * yn + 6.0 * self.p2 * xn;
        let dxy_cross = 2.0 * xn * yn * drad_dr2 + 2.0 * self.p1 * xn + 2.0 * self.p2 * yn;
        let dyd_dyn = radial + 2.0 * yn * yn * drad_dr2 + 6.0 * self.p1 * yn + 2.0 * self.p2 * xn;

        DistortResult {
            xd,
            yd,
            jac: [[dxd_dxn, dxy_cross], [dxy_cross, dyd_dyn]],
        }
    }

    pub fn is_linear(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.k3 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0
    }

    /// Inverse of [`Distortion::apply`] by fixed-point iteration (the standard
    /// OpenCV `undistortPoints` recipe): repeatedly re-distort the current
    /// guess and correct by the residual against `(xd, yd)`. Used by the
    /// camera initializers to turn an observed pixel into a normalized ray
    /// direction before any pose is known.
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        if self.is_linear() {
            return (xd, yd);
        }
        let (mut xn, mut yn) = (xd, yd);
        for _ in 0..20 {
            let r2 = xn * xn + yn * yn;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            let dx = 2.0 * self.p1 * xn * yn + self.p2 * (r2 + 2.0 * xn * xn);
            let dy = self.p1 * (r2 + 2.0 * yn * yn) + 2.0 * self.p2 * xn * yn;
            xn = (xd - dx) / radial;
            yn = (yd - dy) / radial;
        }
        (xn, yn)
    }
}
