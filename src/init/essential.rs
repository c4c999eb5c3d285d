//! Essential-matrix camera-pair initializer (spec §4.F): recovers the
//! relative pose between two uninitialized cameras with no vanishing lines
//! and no fully-constrained shared points, from shared image-point
//! correspondences alone, up to the unresolvable scale that later alignment
//! (`crate::align`) or a user-declared length fixes.
//!
//! Baseline camera is placed at the world origin looking down `+Z`; the
//! second camera's relative pose is the cheirality-selected decomposition of
//! the essential matrix estimated by the normalized 8-point algorithm (with a
//! dedicated 7-point solve when exactly 7 correspondences are available).

use nalgebra::{DMatrix, Matrix3, SVD, Vector3};

use crate::project::{Pose, Project};

/// Arbitrary baseline length (world units) assigned to a freshly initialized
/// camera pair; corrected later by `crate::align` once any locked length is
/// known.
const DEFAULT_BASELINE: f64 = 10.0;

struct Correspondence {
    world_point: usize,
    a: (f64, f64),
    b: (f64, f64),
}

fn normalized_direction(project: &Project, viewpoint: usize, u: f64, v: f64) -> (f64, f64) {
    let vp = &project.viewpoints[viewpoint];
    let xd = (u - vp.intrinsics.principal_point.0) / vp.intrinsics.fx();
    let yd = (vp.intrinsics.principal_point.1 - v) / vp.intrinsics.fy();
    vp.intrinsics.distortion.undistort(xd, yd)
}

fn shared_correspondences(project: &Project, cam_a: usize, cam_b: usize) -> Vec<Correspondence> {
    let mut by_point: std::collections::HashMap<usize, ((f64, f64), (f64, f64))> = std::collections::HashMap::new();
    for ip in &project.image_points {
        if ip.viewpoint == cam_a {
            by_point.entry(ip.world_point).or_insert_with(|| ((0.0, 0.0), (0.0, 0.0))).0 =
                normalized_direction(project, cam_a, ip.observed_u, ip.observed_v);
        }
    }
    let mut out = Vec::new();
    for ip in &project.image_points {
        if ip.viewpoint == cam_b {
            if let Some(entry) = by_point.get(&ip.world_point) {
                out.push(Correspondence {
                    world_point: ip.world_point,
                    a: entry.0,
                    b: normalized_direction(project, cam_b, ip.observed_u, ip.observed_v),
                });
            }
        }
    }
    out
}

fn epipolar_constraint_matrix(pts: &[Correspondence]) -> DMatrix<f64> {
    let n = pts.len();
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (i, c) in pts.iter().enumerate() {
        let (x1, y1) = c.a;
        let (x2, y2) = c.b;
        a.set_row(i, &nalgebra::RowDVector::from_row_slice(&[x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0]));
    }
    a
}

fn unstack(v: nalgebra::RowDVector<f64>) -> Matrix3<f64> {
    let mut m = Matrix3::zeros();
    for row in 0..3 {
        for col in 0..3 {
            m[(row, col)] = v[row * 3 + col];
        }
    }
    m
}

/// Re-enforce `rank(E) = 2` by averaging the two largest singular values and
/// zeroing the third (the standard essential-matrix projection).
fn project_to_essential_manifold(e_raw: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = SVD::try_new(e_raw, true, true, 1e-9, 0)?;
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
    let sigma = Matrix3::from_diagonal(&Vector3::new(s, s, 0.0));
    Some(u * sigma * v_t)
}

/// Normalized 8-point algorithm (Hartley): build the epipolar-constraint
/// matrix and take the smallest right-singular vector, then re-enforce
/// `rank(E) = 2`.
fn eight_point_candidates(pts: &[Correspondence]) -> Vec<Matrix3<f64>> {
    let a = epipolar_constraint_matrix(pts);
    let Some(svd) = SVD::try_new(a, true, true, 1e-9, 200) else {
        return Vec::new();
    };
    let Some(v_t) = svd.v_t else { return Vec::new() };
    let e_raw = unstack(v_t.row(v_t.nrows() - 1).into_owned());
    project_to_essential_manifold(e_raw).into_iter().collect()
}

/// Real roots of `a3·x³ + a2·x² + a1·x + a0 = 0` via Cardano's formula,
/// falling back to treating it as at-most-quadratic if `a3 ≈ 0`.
fn solve_cubic_real_roots(a3: f64, a2: f64, a1: f64, a0: f64) -> Vec<f64> {
    if a3.abs() < 1e-12 {
        if a2.abs() < 1e-12 {
            if a1.abs() < 1e-12 {
                return Vec::new();
            }
            return vec![-a0 / a1];
        }
        let disc = a1 * a1 - 4.0 * a2 * a0;
        if disc < 0.0 {
            return Vec::new();
        }
        let sqrt_disc = disc.sqrt();
        return vec![(-a1 + sqrt_disc) / (2.0 * a2), (-a1 - sqrt_disc) / (2.0 * a2)];
    }

    let (b, c, d) = (a2 / a3, a1 / a3, a0 / a3);
    let p = c - b * b / 3.0;
    let q = 2.0 * b * b * b / 27.0 - b * c / 3.0 + d;
    let shift = |t: f64| t - b / 3.0;

    let disc = (q / 2.0).powi(2) + (p / 3.0).powi(3);
    if disc > 1e-14 {
        let sqrt_disc = disc.sqrt();
        let u = (-q / 2.0 + sqrt_disc).cbrt();
        let v = (-q / 2.0 - sqrt_disc).cbrt();
        vec![shift(u + v)]
    } else if p.abs() < 1e-14 {
        vec![shift(0.0)]
    } else {
        let r = 2.0 * (-p / 3.0).sqrt();
        let phi = ((3.0 * q) / (p * 2.0) * (-3.0 / p).sqrt()).clamp(-1.0, 1.0).acos() / 3.0;
        (0..3).map(|k| shift(r * (phi - 2.0 * std::f64::consts::PI * k as f64 / 3.0).cos())).collect()
    }
}

/// Dedicated 7-point solve: the epipolar-constraint matrix has a 2-D null
/// space (rank 7); enforce `det(E) = 0` over that pencil, which is cubic in
/// the pencil parameter and yields 1 or 3 real candidate essential matrices.
fn seven_point_candidates(pts: &[Correspondence]) -> Vec<Matrix3<f64>> {
    let a = epipolar_constraint_matrix(pts);
    let Some(svd) = SVD::try_new(a, true, true, 1e-9, 200) else {
        return Vec::new();
    };
    let Some(v_t) = svd.v_t else { return Vec::new() };
    if v_t.nrows() < 9 {
        return Vec::new();
    }
    let e1 = unstack(v_t.row(7).into_owned());
    let e2 = unstack(v_t.row(8).into_owned());

    let f = |x: f64| (x * e1 + (1.0 - x) * e2).determinant();
    let samples = [f(0.0), f(1.0), f(2.0), f(3.0)];
    let vander = nalgebra::Matrix4::new(
        1.0, 0.0, 0.0, 0.0, //
        1.0, 1.0, 1.0, 1.0, //
        1.0, 2.0, 4.0, 8.0, //
        1.0, 3.0, 9.0, 27.0,
    );
    let Some(coeffs) = vander.lu().solve(&nalgebra::Vector4::new(samples[0], samples[1], samples[2], samples[3])) else {
        return Vec::new();
    };
    let (a0, a1, a2, a3) = (coeffs[0], coeffs[1], coeffs[2], coeffs[3]);

    solve_cubic_real_roots(a3, a2, a1, a0)
        .into_iter()
        .filter_map(|x| project_to_essential_manifold(x * e1 + (1.0 - x) * e2))
        .collect()
}

fn essential_candidates(pts: &[Correspondence]) -> Vec<Matrix3<f64>> {
    if pts.len() == 7 {
        seven_point_candidates(pts)
    } else {
        eight_point_candidates(pts)
    }
}

/// Decompose `e` into the four candidate `(R, t)` relative poses (Hartley &
/// Zisserman §9.6.2), returned as `(rotation, translation_direction)` pairs;
/// translation is only determined up to sign and scale.
fn candidate_poses(e: &Matrix3<f64>) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    let Some(svd) = SVD::try_new(*e, true, true, 1e-9, 0) else {
        return Vec::new();
    };
    let (Some(mut u), Some(mut v_t)) = (svd.u, svd.v_t) else {
        return Vec::new();
    };
    if u.determinant() < 0.0 {
        u.set_column(2, &(-u.column(2)));
    }
    if v_t.determinant() < 0.0 {
        let neg_row = -v_t.row(2);
        v_t.set_row(2, &neg_row);
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    vec![(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

/// Triangulate `c` under the candidate second-camera `(rotation, translation)`
/// (camera A fixed at the origin, identity orientation) and report whether
/// both cameras see it in front (cheirality).
fn cheirality_ok(c: &Correspondence, rotation: &Matrix3<f64>, translation: Vector3<f64>) -> bool {
    let d1 = Vector3::new(c.a.0, c.a.1, 1.0);
    let d2 = Vector3::new(c.b.0, c.b.1, 1.0);

    // Solve the midpoint of the closest approach between the two rays
    // (camera A at origin along d1; camera B at `translation`, direction
    // `rotation.transpose() * d2` in A's frame).
    let o2 = translation;
    let dir2 = rotation.transpose() * d2;

    let a_dot_a = d1.dot(&d1);
    let a_dot_b = d1.dot(&dir2);
    let b_dot_b = dir2.dot(&dir2);
    let w0 = -o2;
    let a_dot_w = d1.dot(&w0);
    let b_dot_w = dir2.dot(&w0);

    let denom = a_dot_a * b_dot_b - a_dot_b * a_dot_b;
    if denom.abs() < 1e-12 {
        return false;
    }
    let s = (a_dot_b * b_dot_w - b_dot_b * a_dot_w) / denom;
    let t = (a_dot_a * b_dot_w - a_dot_b * a_dot_w) / denom;

    s > 0.0 && t > 0.0
}

fn count_in_front(pts: &[Correspondence], rotation: &Matrix3<f64>, translation: Vector3<f64>) -> usize {
    pts.iter().filter(|c| cheirality_ok(c, rotation, translation)).count()
}

/// Attempt essential-matrix initialization for the pair `(cam_a, cam_b)`.
/// Places `cam_a` at the world origin with identity orientation and `cam_b`
/// at the cheirality-winning decomposition, scaled to [`DEFAULT_BASELINE`].
/// Returns `Err(reason)` with fewer than 8 shared correspondences (7 accepted
/// via the dedicated minimal solve) or a degenerate/singular estimate.
pub fn initialize_pair(project: &mut Project, cam_a: usize, cam_b: usize) -> Result<(), String> {
    let correspondences = shared_correspondences(project, cam_a, cam_b);
    if correspondences.len() < 7 {
        return Err(format!("fewer than 7 shared correspondences ({})", correspondences.len()));
    }

    let e_candidates = essential_candidates(&correspondences);
    if e_candidates.is_empty() {
        return Err("essential matrix estimation was singular".into());
    }

    let pose_candidates: Vec<(Matrix3<f64>, Vector3<f64>)> = e_candidates.iter().flat_map(|e| candidate_poses(e)).collect();
    if pose_candidates.is_empty() {
        return Err("essential matrix decomposition failed".into());
    }

    let best = pose_candidates
        .into_iter()
        .max_by_key(|(r, t)| count_in_front(&correspondences, r, *t))
        .unwrap();
    let in_front = count_in_front(&correspondences, &best.0, best.1);
    if in_front * 2 < correspondences.len() {
        return Err("no cheirality-consistent decomposition found".into());
    }

    let translation_dir = if best.1.norm() > 1e-9 { best.1.normalize() } else { Vector3::z() };

    project.viewpoints[cam_a].pose = Pose {
        position: Vector3::zeros(),
        quaternion: nalgebra::Vector4::new(1.0, 0.0, 0.0, 0.0),
    };
    project.viewpoints[cam_a].is_initialized = true;

    let cam_b_position = translation_dir * DEFAULT_BASELINE;
    project.viewpoints[cam_b].pose = Pose {
        position: cam_b_position,
        quaternion: crate::geometry::quat_from_rotation_matrix(&best.0),
    };
    project.viewpoints[cam_b].is_initialized = true;

    Ok(())
}

/// Pick the best candidate pair of currently-uninitialized, enabled cameras
/// to seed with the essential matrix: the pair sharing the most
/// correspondences (spec §4.F "try the two cameras with the most shared
/// observations").
pub fn best_pair(project: &Project) -> Option<(usize, usize)> {
    let candidates: Vec<usize> = (0..project.viewpoints.len())
        .filter(|&i| project.viewpoints[i].enabled_in_solve && !project.viewpoints[i].is_initialized)
        .collect();

    let mut best: Option<(usize, usize, usize)> = None;
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            let (a, b) = (candidates[i], candidates[j]);
            let shared = shared_correspondences(project, a, b).len();
            if best.map(|(_, _, n)| shared > n).unwrap_or(true) {
                best = Some((a, b, shared));
            }
        }
    }
    best.filter(|(_, _, n)| *n >= 7).map(|(a, b, _)| (a, b))
}
