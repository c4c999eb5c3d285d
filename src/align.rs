//! Scene alignment (spec §4.H): fixing the gauge freedom left over after
//! triangulation by rotating/rescaling the whole scene to agree with
//! user-declared anchors.
//!
//! The similarity-alignment solve (rotation + translation + isotropic scale
//! from two matched point sets) is the Kabsch–Umeyama algorithm, adapted from
//! `geometry/mvg/src/align_points.rs`'s `align_points` using the same
//! `nalgebra::linalg::SVD` already in this crate's dependency stack; axis
//! alignment is the same SVD machinery specialised to rotation-only fitting
//! (Wahba's problem) over direction vectors instead of point clouds.

use nalgebra::{Matrix3, SVD, Vector3};

use crate::project::{Axis, LineDirectionConstraint, Project};

/// A rigid similarity transform: `x' = scale * rotation * x + translation`.
#[derive(Debug, Clone, Copy)]
pub struct Similarity {
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Similarity {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn apply_point(&self, p: Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn apply_rotation(&self, r: Matrix3<f64>) -> Matrix3<f64> {
        self.rotation * r
    }
}

/// Fit the rotation that best aligns `directions` (unit vectors, as observed
/// in the current reconstruction) onto `targets` (the nominal world axes they
/// are meant to represent), by least-squares Procrustes (Wahba's problem: no
/// translation, no scale, since these are directions, not positions).
///
/// Returns `None` if fewer than 2 non-parallel direction/target pairs are
/// given, matching spec §4.H "fixes 1–3 rotational DoF depending on how many
/// distinct axes are constrained" (a single direction cannot pin the
/// remaining in-plane rotation).
pub fn fit_axis_rotation(directions: &[Vector3<f64>], targets: &[Vector3<f64>]) -> Option<Matrix3<f64>> {
    if directions.len() != targets.len() || directions.len() < 2 {
        return None;
    }

    let mut m = Matrix3::zeros();
    for (d, t) in directions.iter().zip(targets) {
        m += t * d.transpose();
    }

    let svd = SVD::try_new(m, true, true, 1e-9, 0)?;
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut s = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }
    Some(u * s * v_t)
}

/// Axis alignment (spec §4.H): collect axis-aligned [`Line`](crate::project::Line)
/// directions from the current triangulation, fit the rotation bringing them
/// onto their nominal axes, and apply it (about the scene centroid) to every
/// world point and camera pose. No-op (identity) if fewer than two
/// axis-direction constraints are present.
pub fn axis_align(project: &mut Project) -> Similarity {
    let mut directions = Vec::new();
    let mut targets = Vec::new();

    for line in &project.lines {
        let Some(a) = project.world_points[line.point_a].effective_point() else { continue };
        let Some(b) = project.world_points[line.point_b].effective_point() else { continue };
        let delta = b - a;
        if delta.norm() < 1e-9 {
            continue;
        }
        match line.direction {
            LineDirectionConstraint::Axis(axis) => {
                directions.push(delta.normalize());
                targets.push(axis.unit_vector());
            }
            _ => continue,
        }
    }

    let Some(rotation) = fit_axis_rotation(&directions, &targets) else {
        return Similarity::identity();
    };

    let xform = Similarity {
        scale: 1.0,
        rotation,
        translation: Vector3::zeros(),
    };
    apply_similarity(project, &xform);
    xform
}

/// Closed-form similarity fit (Kabsch–Umeyama) of `sources` onto `targets`:
/// `target_i ≈ scale * rotation * source_i + translation`. `None` if fewer
/// than 1 point, mismatched lengths, or a degenerate covariance.
pub fn fit_similarity(sources: &[Vector3<f64>], targets: &[Vector3<f64>]) -> Option<Similarity> {
    let n = sources.len();
    if n == 0 || n != targets.len() {
        return None;
    }

    let mean = |pts: &[Vector3<f64>]| pts.iter().fold(Vector3::zeros(), |acc, p| acc + p) / (n as f64);
    let mu_s = mean(sources);
    let mu_t = mean(targets);

    let centered_s: Vec<Vector3<f64>> = sources.iter().map(|p| p - mu_s).collect();
    let centered_t: Vec<Vector3<f64>> = targets.iter().map(|p| p - mu_t).collect();

    if n < 3 {
        // Not enough points to determine rotation; translation/scale only.
        let var_s: f64 = centered_s.iter().map(|p| p.norm_squared()).sum::<f64>() / n as f64;
        let var_t: f64 = centered_t.iter().map(|p| p.norm_squared()).sum::<f64>() / n as f64;
        if var_s < 1e-12 {
            return Some(Similarity {
                scale: 1.0,
                rotation: Matrix3::identity(),
                translation: mu_t - mu_s,
            });
        }
        let scale = (var_t / var_s).sqrt();
        return Some(Similarity {
            scale,
            rotation: Matrix3::identity(),
            translation: mu_t - scale * mu_s,
        });
    }

    let mut cov = Matrix3::zeros();
    for (s, t) in centered_s.iter().zip(&centered_t) {
        cov += t * s.transpose();
    }
    cov /= n as f64;

    let svd = SVD::try_new(cov, true, true, 1e-9, 0)?;
    let u = svd.u?;
    let d = svd.singular_values;
    let v_t = svd.v_t?;

    let mut s = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }
    let rotation = u * s * v_t;

    let var_s: f64 = centered_s.iter().map(|p| p.norm_squared()).sum::<f64>() / n as f64;
    if var_s < 1e-12 {
        return None;
    }
    let scale = (Matrix3::from_diagonal(&d) * s).trace() / var_s;

    let translation = mu_t - scale * (rotation * mu_s);

    Some(Similarity { scale, rotation, translation })
}

/// Similarity alignment to locked points (spec §4.H): maps the current
/// triangulated positions of every fully-locked world point onto its lock
/// target, then applies the resulting transform to the whole scene. No-op if
/// no locked points exist.
pub fn similarity_align_to_locked_points(project: &mut Project) -> Similarity {
    let mut sources = Vec::new();
    let mut targets = Vec::new();

    for wp in &project.world_points {
        let (Some(locked), Some(current)) = (locked_target(wp), wp.optimized_xyz) else { continue };
        sources.push(Vector3::new(current[0], current[1], current[2]));
        targets.push(locked);
    }

    let Some(xform) = fit_similarity(&sources, &targets) else {
        return Similarity::identity();
    };
    apply_similarity(project, &xform);
    xform
}

fn locked_target(wp: &crate::project::WorldPoint) -> Option<Vector3<f64>> {
    if wp.locked_xyz.iter().all(Option::is_some) {
        Some(Vector3::new(wp.locked_xyz[0].unwrap(), wp.locked_xyz[1].unwrap(), wp.locked_xyz[2].unwrap()))
    } else {
        None
    }
}

/// Scale-only correction for the PnP path (spec §4.H): the mean ratio of
/// locked pairwise distance to triangulated pairwise distance, applied as a
/// uniform scale about the scene centroid. Returns `1.0` (no-op) with fewer
/// than two locked, triangulated points.
pub fn scale_only_correction(project: &mut Project) -> f64 {
    let locked: Vec<(Vector3<f64>, Vector3<f64>)> = project
        .world_points
        .iter()
        .filter_map(|wp| Some((locked_target(wp)?, {
            let p = wp.optimized_xyz?;
            Vector3::new(p[0], p[1], p[2])
        })))
        .collect();

    if locked.len() < 2 {
        return 1.0;
    }

    let mut ratios = Vec::new();
    for i in 0..locked.len() {
        for j in (i + 1)..locked.len() {
            let target_dist = (locked[i].0 - locked[j].0).norm();
            let current_dist = (locked[i].1 - locked[j].1).norm();
            if current_dist > 1e-9 {
                ratios.push(target_dist / current_dist);
            }
        }
    }
    if ratios.is_empty() {
        return 1.0;
    }
    let scale = ratios.iter().sum::<f64>() / ratios.len() as f64;

    let xform = Similarity {
        scale,
        rotation: Matrix3::identity(),
        translation: Vector3::zeros(),
    };
    apply_similarity(project, &xform);
    scale
}

/// Apply `xform` to every world point's `optimized_xyz` and every camera's
/// pose (position and rotation; focal length is untouched).
fn apply_similarity(project: &mut Project, xform: &Similarity) {
    for wp in &mut project.world_points {
        if let Some(p) = wp.optimized_xyz {
            let p = xform.apply_point(Vector3::new(p[0], p[1], p[2]));
            wp.optimized_xyz = Some([p.x, p.y, p.z]);
        }
    }
    for vp in &mut project.viewpoints {
        if vp.is_pose_locked {
            continue;
        }
        vp.pose.position = xform.apply_point(vp.pose.position);
        let r = crate::geometry::quat_to_matrix(&vp.pose.quaternion);
        let r_new = xform.apply_rotation(r.transpose()).transpose();
        vp.pose.quaternion = crate::geometry::quat_from_rotation_matrix(&r_new);
    }
}
