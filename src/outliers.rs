//! Outlier detection (spec §4.I): per-observation reprojection error against
//! a median-robust threshold, plus the late-PnP exclusion cascade.

use nalgebra::Vector3;

use crate::project::Project;

/// Predicted pixel position of `world_point` as seen by `viewpoint`, against
/// the project's current pose/intrinsics. `None` if the world point is
/// undetermined or falls behind the camera.
fn predict_pixel(project: &Project, world_point: usize, viewpoint: usize) -> Option<(f64, f64)> {
    let world = project.world_points[world_point].effective_point()?;
    let vp = &project.viewpoints[viewpoint];
    let r = crate::geometry::quat_to_matrix(&vp.pose.quaternion);
    let cam: Vector3<f64> = r * (world - vp.pose.position);
    if cam.z <= 0.0 {
        return None;
    }
    let dist = vp.intrinsics.distortion.apply(cam.x / cam.z, cam.y / cam.z);
    let u = vp.intrinsics.fx() * dist.xd + vp.intrinsics.principal_point.0;
    let v = vp.intrinsics.principal_point.1 - vp.intrinsics.fy() * dist.yd;
    Some((u, v))
}

/// Recompute and store `last_residual` for every image point whose camera is
/// still enabled in the solve. Returns `(index, error)` pairs for points that
/// had a determinable error (spec §4.C/§4.I precondition).
pub fn compute_residuals(project: &mut Project) -> Vec<(usize, f64)> {
    let mut out = Vec::new();
    for i in 0..project.image_points.len() {
        let (wp, vp, u, v) = {
            let ip = &project.image_points[i];
            (ip.world_point, ip.viewpoint, ip.observed_u, ip.observed_v)
        };
        if !project.viewpoints[vp].enabled_in_solve {
            continue;
        }
        let Some((pred_u, pred_v)) = predict_pixel(project, wp, vp) else { continue };
        project.image_points[i].last_residual = Some((pred_u - u, pred_v - v));
        out.push((i, ((pred_u - u).powi(2) + (pred_v - v).powi(2)).sqrt()));
    }
    out
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted[sorted.len() / 2]
}

/// The median-robust threshold of spec §4.I: `max(k·m, 50px)` if `m < 20`,
/// else `min(k·m, 80px)`.
pub fn threshold_for_median(median_error: f64, k: f64) -> f64 {
    if median_error < 20.0 {
        (k * median_error).max(50.0)
    } else {
        (k * median_error).min(80.0)
    }
}

#[derive(Debug, Clone)]
pub struct OutlierResult {
    pub median_error: f64,
    pub threshold: f64,
    /// Indices into `project.image_points`, sorted ascending.
    pub outlier_indices: Vec<usize>,
}

/// Run spec §4.I over every still-enabled observation: compute the error
/// distribution, the threshold from `k`, flag `is_outlier` accordingly, and
/// return the sorted list of flagged indices plus the statistics used.
pub fn detect(project: &mut Project, k: f64) -> OutlierResult {
    let errors = compute_residuals(project);
    let values: Vec<f64> = errors.iter().map(|(_, e)| *e).collect();
    let median_error = median(&values);
    let threshold = threshold_for_median(median_error, k);

    for ip in &mut project.image_points {
        ip.is_outlier = false;
    }
    let mut outlier_indices = Vec::new();
    for (i, err) in &errors {
        if *err > threshold {
            project.image_points[*i].is_outlier = true;
            outlier_indices.push(*i);
        }
    }
    outlier_indices.sort_unstable();

    OutlierResult { median_error, threshold, outlier_indices }
}

/// Cascade policy (spec §4.I): among `late_pnp_viewpoints`, which ones have
/// 100% of their still-enabled observations flagged as outliers. These are
/// candidates for exclude-and-resolve-once.
pub fn cascade_candidates(project: &Project, late_pnp_viewpoints: &[usize]) -> Vec<usize> {
    late_pnp_viewpoints
        .iter()
        .copied()
        .filter(|&vp| {
            let obs: Vec<&crate::project::ImagePoint> = project
                .image_points
                .iter()
                .filter(|ip| ip.viewpoint == vp && project.viewpoints[ip.viewpoint].enabled_in_solve)
                .collect();
            !obs.is_empty() && obs.iter().all(|ip| ip.is_outlier)
        })
        .collect()
}
