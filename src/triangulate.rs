//! Point initialization (spec §4.G): multi-view triangulation, single-view
//! back-projection, and constraint-chain propagation.
//!
//! Multi-view triangulation delegates the actual least-squares ray
//! intersection to [`cam_geom::best_intersection_of_rays`], the same routine
//! `braid-mvg`'s `MultiCameraSystem::find3d` uses — rays are built here from
//! this crate's own (possibly non-unit) quaternion pose representation rather
//! than a `cam_geom::Camera`, since our intrinsics/pose model doesn't map
//! cleanly onto `cam_geom`'s calibrated-camera type.

use cam_geom::{Ray, WorldFrame};
use nalgebra::{RowVector3, Vector3};

use crate::project::{Project, Viewpoint};

/// Minimum angle (radians) between two candidate rays for their intersection
/// to be considered well-conditioned. About 2 degrees.
const MIN_PARALLAX_RADIANS: f64 = 0.035;

/// World-frame ray origin and (unnormalized) direction for a pixel
/// observation, using the undistorted normalized direction and this crate's
/// general (non-unit-safe) rotation.
fn world_ray(viewpoint: &Viewpoint, u: f64, v: f64) -> (Vector3<f64>, Vector3<f64>) {
    let intr = &viewpoint.intrinsics;
    let xd = (u - intr.principal_point.0) / intr.fx();
    let yd = (intr.principal_point.1 - v) / intr.fy();
    let (xn, yn) = intr.distortion.undistort(xd, yd);
    let dir_cam = Vector3::new(xn, yn, 1.0);

    let r = crate::geometry::quat_to_matrix(&viewpoint.pose.quaternion);
    let dir_world = r.transpose() * dir_cam;
    (viewpoint.pose.position, dir_world)
}

fn as_cam_geom_ray(origin: Vector3<f64>, direction: Vector3<f64>) -> Ray<WorldFrame, f64> {
    Ray::new(
        RowVector3::new(origin.x, origin.y, origin.z),
        RowVector3::new(direction.x, direction.y, direction.z),
    )
}

/// One observation available for triangulating a world point: the viewpoint
/// and the pixel it was seen at.
pub struct Observation {
    pub viewpoint: usize,
    pub u: f64,
    pub v: f64,
}

/// Gather every observation of `world_point` in a camera that is both
/// enabled and initialized.
pub fn observations_in_initialized_cameras(project: &Project, world_point: usize) -> Vec<Observation> {
    project
        .image_points
        .iter()
        .filter(|ip| ip.world_point == world_point)
        .filter_map(|ip| {
            let vp = &project.viewpoints[ip.viewpoint];
            if vp.enabled_in_solve && vp.is_initialized {
                Some(Observation {
                    viewpoint: ip.viewpoint,
                    u: ip.observed_u,
                    v: ip.observed_v,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Whether the rays cast by `observations` diverge enough to triangulate
/// reliably (spec §4.G.1 "sufficient parallax"): at least one pair of rays
/// more than [`MIN_PARALLAX_RADIANS`] apart.
fn has_sufficient_parallax(project: &Project, observations: &[Observation]) -> bool {
    let dirs: Vec<Vector3<f64>> = observations
        .iter()
        .map(|o| world_ray(&project.viewpoints[o.viewpoint], o.u, o.v).1.normalize())
        .collect();
    for i in 0..dirs.len() {
        for j in (i + 1)..dirs.len() {
            let cos = dirs[i].dot(&dirs[j]).clamp(-1.0, 1.0);
            if cos.acos() > MIN_PARALLAX_RADIANS {
                return true;
            }
        }
    }
    false
}

/// DLT/ray-intersection triangulation from `observations` (spec §4.G.1).
/// Returns `None` if fewer than two observations or parallax is insufficient.
pub fn multi_view_triangulate(project: &Project, observations: &[Observation]) -> Option<Vector3<f64>> {
    if observations.len() < 2 || !has_sufficient_parallax(project, observations) {
        return None;
    }
    let rays: Vec<_> = observations
        .iter()
        .map(|o| {
            let (origin, dir) = world_ray(&project.viewpoints[o.viewpoint], o.u, o.v);
            as_cam_geom_ray(origin, dir)
        })
        .collect();
    let pt = cam_geom::best_intersection_of_rays(&rays).ok()?;
    Some(Vector3::new(pt.data[(0, 0)], pt.data[(0, 1)], pt.data[(0, 2)]))
}

/// Back-project a single observation to `depth` along its view ray (spec
/// §4.G.2, "single-view" fallback).
pub fn back_project_single_view(viewpoint: &Viewpoint, u: f64, v: f64, depth: f64) -> Vector3<f64> {
    let (origin, dir) = world_ray(viewpoint, u, v);
    origin + dir.normalize() * depth
}

/// Median camera-frame depth (Z) of points that already have a determined
/// position, as seen by whichever of their observing cameras is initialized.
/// Used as the single-view fallback depth when no other constraint anchors
/// the point (spec §4.G.2).
fn median_multi_view_depth(project: &Project, multi_view_points: &[Vector3<f64>]) -> f64 {
    let mut depths: Vec<f64> = Vec::new();
    for vp in &project.viewpoints {
        if !vp.is_initialized {
            continue;
        }
        for p in multi_view_points {
            let cam = crate::geometry::quat_to_matrix(&vp.pose.quaternion) * (p - vp.pose.position);
            if cam.z > 0.0 {
                depths.push(cam.z);
            }
        }
    }
    if depths.is_empty() {
        return 10.0 * estimate_scene_scale(project);
    }
    depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
    depths[depths.len() / 2]
}

fn estimate_scene_scale(project: &Project) -> f64 {
    project
        .lines
        .iter()
        .filter_map(|l| l.target_length)
        .fold(1.0_f64, f64::max)
}

/// Runs spec §4.G's full point-initialization pass: multi-view triangulation
/// for points seen by ≥2 initialized cameras, single-view back-projection for
/// the rest, leaving anything unreachable untouched (its regularization
/// residual is then simply omitted, per §4.C).
///
/// Returns the ids of points that were assigned by single-view
/// back-projection, so callers can re-triangulate them once more geometry has
/// stabilized (spec §4.G "two-stage ordering").
pub fn initialize_world_points(project: &mut Project, logger: &mut crate::logger::Logger) -> Vec<usize> {
    let mut single_view_ids = Vec::new();
    let mut multi_view_positions = Vec::new();

    for id in 0..project.world_points.len() {
        if project.world_points[id].is_fully_constrained() {
            continue;
        }
        let observations = observations_in_initialized_cameras(project, id);
        if let Some(p) = multi_view_triangulate(project, &observations) {
            project.world_points[id].optimized_xyz = Some([p.x, p.y, p.z]);
            multi_view_positions.push(p);
        }
    }

    for id in 0..project.world_points.len() {
        if project.world_points[id].is_fully_constrained() || project.world_points[id].optimized_xyz.is_some() {
            continue;
        }
        let observations = observations_in_initialized_cameras(project, id);
        if let [obs] = observations.as_slice() {
            let depth = median_multi_view_depth(project, &multi_view_positions);
            let p = back_project_single_view(&project.viewpoints[obs.viewpoint], obs.u, obs.v, depth);
            project.world_points[id].optimized_xyz = Some([p.x, p.y, p.z]);
            single_view_ids.push(id);
            logger.log(crate::logger::Tag::Init, format!("point {id} initialized by single-view back-projection"));
        }
    }

    project.propagate_inferences();

    single_view_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ImagePoint, Pose, WorldPoint};
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    fn looking_down_z(position: Vector3<f64>) -> Viewpoint {
        let mut vp = Viewpoint::default();
        vp.pose = Pose {
            position,
            quaternion: Vector4::new(1.0, 0.0, 0.0, 0.0),
        };
        vp.is_initialized = true;
        vp
    }

    #[test]
    fn triangulates_point_seen_from_two_cameras() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::free());
        project.viewpoints.push(looking_down_z(Vector3::new(-2.0, 0.0, -10.0)));
        project.viewpoints.push(looking_down_z(Vector3::new(2.0, 0.0, -10.0)));

        let truth = Vector3::new(0.0, 0.0, 0.0);
        for vp_id in 0..2 {
            let vp = &project.viewpoints[vp_id];
            let rel = truth - vp.pose.position;
            let u = vp.intrinsics.fx() * (rel.x / rel.z) + vp.intrinsics.principal_point.0;
            let v = vp.intrinsics.principal_point.1 - vp.intrinsics.fy() * (rel.y / rel.z);
            project.image_points.push(ImagePoint::new(0, vp_id, u, v));
        }

        let observations = observations_in_initialized_cameras(&project, 0);
        let triangulated = multi_view_triangulate(&project, &observations).unwrap();
        assert_relative_eq!(triangulated, truth, epsilon = 1e-6);
    }

    #[test]
    fn insufficient_parallax_returns_none() {
        let mut project = Project::new();
        project.viewpoints.push(looking_down_z(Vector3::new(0.0, 0.0, -10.0)));
        project.viewpoints.push(looking_down_z(Vector3::new(0.0001, 0.0, -10.0)));
        let observations = vec![
            Observation { viewpoint: 0, u: 0.0, v: 0.0 },
            Observation { viewpoint: 1, u: 0.0, v: 0.0 },
        ];
        assert!(multi_view_triangulate(&project, &observations).is_none());
    }
}
