//! End-to-end scenarios, one per documented use case: a caller builds a
//! `Project` from scratch (no pose, no calibration beyond nominal
//! intrinsics) and checks what `optimize()` recovers.

use nalgebra::{Vector3, Vector4};
use photo_adjust::pipeline::{self, Options};
use photo_adjust::project::{
    Axis, Constraint, ImagePoint, Line, LineDirectionConstraint, Pose, Project, VanishingLine, Viewpoint, WorldPoint,
};

/// Project a world point into a camera with identity-rotation-relative pose
/// math matching the convention used throughout this crate's own unit tests:
/// `cam = R (world - campos)`, `u = fx*cam.x/cam.z + cx`, `v = cy - fy*cam.y/cam.z`.
fn project_point(vp: &Viewpoint, world: Vector3<f64>) -> (f64, f64) {
    let r = photo_adjust::geometry::quat_to_matrix(&vp.pose.quaternion);
    let cam = r * (world - vp.pose.position);
    let (xn, yn) = (cam.x / cam.z, cam.y / cam.z);
    let dist = vp.intrinsics.distortion.apply(xn, yn);
    let u = vp.intrinsics.fx() * dist.xd + vp.intrinsics.principal_point.0;
    let v = vp.intrinsics.principal_point.1 - vp.intrinsics.fy() * dist.yd;
    (u, v)
}

fn identity_camera(position: Vector3<f64>, width: usize, height: usize) -> Viewpoint {
    let mut vp = Viewpoint::default();
    vp.width = width;
    vp.height = height;
    vp.intrinsics.principal_point = (width as f64 / 2.0, height as f64 / 2.0);
    vp.pose = Pose { position, quaternion: Vector4::new(1.0, 0.0, 0.0, 0.0) };
    vp
}

/// Scenario 1: single calibrated camera, four locked points, PnP recovers
/// its pose directly.
#[test]
fn simple_pnp_recovers_known_camera_pose() {
    let mut project = Project::new();
    let truth_points = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(10.0, 0.0, 0.0),
        Vector3::new(0.0, 10.0, 0.0),
        Vector3::new(0.0, 0.0, 10.0),
    ];
    for p in truth_points {
        project.world_points.push(WorldPoint::locked([p.x, p.y, p.z]));
    }

    let truth_pose = Pose { position: Vector3::new(0.0, 0.0, -20.0), quaternion: Vector4::new(1.0, 0.0, 0.0, 0.0) };
    let vp = identity_camera(truth_pose.position, 1000, 1000);
    project.viewpoints.push(vp);

    for (i, p) in truth_points.iter().enumerate() {
        let (u, v) = project_point(&project.viewpoints[0], *p);
        project.image_points.push(ImagePoint::new(i, 0, u, v));
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);
    assert!(result.median_reprojection_error < 2.0, "median error {}", result.median_reprojection_error);
    approx::assert_relative_eq!(project.viewpoints[0].pose.position, truth_pose.position, epsilon = 0.5);
}

/// Scenario 2: two uncalibrated (pose-wise) cameras, eight unlocked points,
/// no fully-constrained anchor — falls back to essential-matrix init.
#[test]
fn essential_matrix_initializes_camera_pair() {
    let mut project = Project::new();
    let truth_points = [
        Vector3::new(-5.0, -5.0, 0.0),
        Vector3::new(5.0, -5.0, 0.0),
        Vector3::new(-5.0, 5.0, 0.0),
        Vector3::new(5.0, 5.0, 0.0),
        Vector3::new(-5.0, -5.0, 5.0),
        Vector3::new(5.0, -5.0, 5.0),
        Vector3::new(-5.0, 5.0, 5.0),
        Vector3::new(5.0, 5.0, 5.0),
    ];
    for _ in truth_points {
        project.world_points.push(WorldPoint::free());
    }

    let cam_a = identity_camera(Vector3::new(0.0, 0.0, -20.0), 1000, 1000);
    let cam_b = identity_camera(Vector3::new(20.0, 0.0, -20.0), 1000, 1000);
    project.viewpoints.push(cam_a);
    project.viewpoints.push(cam_b);

    for (i, p) in truth_points.iter().enumerate() {
        for cam in 0..2 {
            let (u, v) = project_point(&project.viewpoints[cam], *p);
            project.image_points.push(ImagePoint::new(i, cam, u, v));
        }
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);
    assert_eq!(result.cameras_initialized.len(), 2, "log: {:?}", result.log);
    assert!(result.median_reprojection_error < 2.0, "median error {}", result.median_reprojection_error);

    let pair_distance = (project.viewpoints[0].pose.position - project.viewpoints[1].pose.position).norm();
    assert!(pair_distance > 0.5, "pair distance {pair_distance}");
}

/// Scenario 3: a 10x10x10 cube plus four face centres, two cameras,
/// twelve edge-length constraints, six face coplanarity constraints, and a
/// single locked corner. Cameras have no fully-constrained anchor beyond the
/// one locked corner, so essential-matrix init carries the pair, and the
/// edge/coplanarity residuals pull the unlocked corners into shape.
#[test]
fn mixed_coplanar_and_length_cube_converges() {
    let mut project = Project::new();
    let corners = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(10.0, 0.0, 0.0),
        Vector3::new(10.0, 10.0, 0.0),
        Vector3::new(0.0, 10.0, 0.0),
        Vector3::new(0.0, 0.0, 10.0),
        Vector3::new(10.0, 0.0, 10.0),
        Vector3::new(10.0, 10.0, 10.0),
        Vector3::new(0.0, 10.0, 10.0),
    ];
    let face_centers = [
        Vector3::new(5.0, 5.0, 0.0),
        Vector3::new(5.0, 5.0, 10.0),
        Vector3::new(5.0, 0.0, 5.0),
        Vector3::new(0.0, 5.0, 5.0),
    ];

    project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
    for _ in corners.iter().skip(1) {
        project.world_points.push(WorldPoint::free());
    }
    for _ in &face_centers {
        project.world_points.push(WorldPoint::free());
    }
    let all_points: Vec<Vector3<f64>> = corners.iter().chain(face_centers.iter()).copied().collect();

    let edges: [(usize, usize); 12] = [
        (0, 1), (1, 2), (2, 3), (3, 0),
        (4, 5), (5, 6), (6, 7), (7, 4),
        (0, 4), (1, 5), (2, 6), (3, 7),
    ];
    for (a, b) in edges {
        project.lines.push(Line { point_a: a, point_b: b, target_length: Some(10.0), direction: LineDirectionConstraint::Free });
    }

    let faces: [[usize; 4]; 6] = [
        [0, 1, 2, 3],
        [4, 5, 6, 7],
        [0, 1, 5, 4],
        [3, 2, 6, 7],
        [0, 3, 7, 4],
        [1, 2, 6, 5],
    ];
    for face in faces {
        project.constraints.push(Constraint::Coplanar { points: face.to_vec() });
    }

    let cam_a = identity_camera(Vector3::new(5.0, 5.0, -40.0), 2000, 2000);
    let cam_b = identity_camera(Vector3::new(35.0, 5.0, -45.0), 2000, 2000);
    project.viewpoints.push(cam_a);
    project.viewpoints.push(cam_b);

    for (i, p) in all_points.iter().enumerate() {
        for cam in 0..2 {
            let (u, v) = project_point(&project.viewpoints[cam], *p);
            project.image_points.push(ImagePoint::new(i, cam, u, v));
        }
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);

    for (a, b) in edges {
        let pa = project.world_points[a].effective_point().unwrap();
        let pb = project.world_points[b].effective_point().unwrap();
        let length = (pa - pb).norm();
        assert!((length - 10.0).abs() < 2.0, "edge ({a},{b}) length {length}");
    }

    for face in faces {
        let p0 = project.world_points[face[0]].effective_point().unwrap();
        let p1 = project.world_points[face[1]].effective_point().unwrap();
        let p2 = project.world_points[face[2]].effective_point().unwrap();
        let p3 = project.world_points[face[3]].effective_point().unwrap();
        let n = (p1 - p0).cross(&(p2 - p0)).normalize();
        let deviation = (p3 - p0).dot(&n).abs();
        assert!(deviation < 0.01, "face {face:?} deviation {deviation}");
    }
}

/// Scenario 4: one locked origin, seven free points, a single length
/// constraint recovering scale, two coplanarity constraints, no vanishing
/// lines — essential-matrix init plus the length residual should pin the
/// scene down to sub-pixel reprojection error.
#[test]
fn no_axis_essential_matrix_with_length_anchor_converges() {
    let mut project = Project::new();
    let truth_points = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(20.0, 0.0, 0.0),
        Vector3::new(20.0, 20.0, 0.0),
        Vector3::new(0.0, 20.0, 0.0),
        Vector3::new(0.0, 0.0, 15.0),
        Vector3::new(20.0, 0.0, 15.0),
        Vector3::new(20.0, 20.0, 15.0),
        Vector3::new(0.0, 20.0, 15.0),
    ];
    project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
    for _ in truth_points.iter().skip(1) {
        project.world_points.push(WorldPoint::free());
    }

    project.lines.push(Line { point_a: 0, point_b: 1, target_length: Some(20.0), direction: LineDirectionConstraint::Free });
    project.constraints.push(Constraint::Coplanar { points: vec![0, 1, 2, 3] });
    project.constraints.push(Constraint::Coplanar { points: vec![4, 5, 6, 7] });

    let cam_a = identity_camera(Vector3::new(10.0, 10.0, -40.0), 2000, 2000);
    let cam_b = identity_camera(Vector3::new(10.0, 40.0, -45.0), 2000, 2000);
    project.viewpoints.push(cam_a);
    project.viewpoints.push(cam_b);

    for (i, p) in truth_points.iter().enumerate() {
        for cam in 0..2 {
            let (u, v) = project_point(&project.viewpoints[cam], *p);
            project.image_points.push(ImagePoint::new(i, cam, u, v));
        }
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);
    assert!(result.median_reprojection_error < 0.2, "median error {}", result.median_reprojection_error);

    let length = (project.world_points[0].effective_point().unwrap() - project.world_points[1].effective_point().unwrap()).norm();
    assert!((length - 20.0).abs() < 0.1, "length {length}");

    let origin = project.world_points[0].effective_point().unwrap();
    approx::assert_relative_eq!(origin, Vector3::zeros(), epsilon = 1e-3);
}

/// Scenario 5: one camera, four locked points, one observation deliberately
/// displaced by 50px — the outlier detector should flag exactly that one.
#[test]
fn outlier_cascade_flags_only_the_displaced_observation() {
    let mut project = Project::new();
    let truth_points = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(10.0, 0.0, 0.0),
        Vector3::new(0.0, 10.0, 0.0),
        Vector3::new(0.0, 0.0, 10.0),
    ];
    for p in truth_points {
        project.world_points.push(WorldPoint::locked([p.x, p.y, p.z]));
    }

    let vp = identity_camera(Vector3::new(0.0, 0.0, -20.0), 1000, 1000);
    project.viewpoints.push(vp);

    for (i, p) in truth_points.iter().enumerate() {
        let (u, v) = project_point(&project.viewpoints[0], *p);
        project.image_points.push(ImagePoint::new(i, 0, u, v));
    }
    project.image_points[3].observed_u += 50.0;

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);
    assert_eq!(result.outliers, vec![3], "log: {:?}", result.log);
    assert!(result.median_reprojection_error < 2.0, "median error {}", result.median_reprojection_error);
}

/// Scenario 6: garbage intrinsics (negative aspect ratio, huge skew,
/// out-of-range focal length) plus four locked points and nine vanishing
/// lines (three per axis) — sanitisation plus VP init should still recover
/// a usable pose.
#[test]
fn focal_length_sign_flip_guard_sanitizes_and_converges() {
    let mut project = Project::new();
    let truth_points = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(10.0, 0.0, 0.0),
        Vector3::new(0.0, 10.0, 0.0),
        Vector3::new(0.0, 0.0, 10.0),
    ];
    for p in truth_points {
        project.world_points.push(WorldPoint::locked([p.x, p.y, p.z]));
    }

    // A tilted pose, not identity: every world axis has a non-zero Z
    // component in camera frame, so its vanishing line has a well-defined
    // finite pixel direction. (An axis-aligned pose makes the vanishing
    // point for any axis perpendicular to the optical axis sit at infinity,
    // which no finite `direction_px` can encode.)
    let uq = nalgebra::UnitQuaternion::from_euler_angles(0.3, -0.5, 1.1);
    let q = Vector4::new(uq.w, uq.i, uq.j, uq.k);
    let r = photo_adjust::geometry::quat_to_matrix(&q);

    let mut vp = Viewpoint::default();
    vp.width = 1000;
    vp.height = 1000;
    vp.pose = Pose { position: Vector3::new(0.0, 0.0, -20.0), quaternion: q };
    vp.intrinsics.skew = -136.0;
    vp.intrinsics.aspect_ratio = -2.95;
    vp.intrinsics.focal_length = 50_000.0;
    vp.intrinsics.principal_point = (5000.0, 5000.0);
    let sanitized_fx = 1000.0;
    for (axis, idx) in [(Axis::X, 0), (Axis::Y, 1), (Axis::Z, 2)] {
        let c = r.column(idx).into_owned();
        let direction_px = (sanitized_fx * c.x / c.z, -sanitized_fx * c.y / c.z);
        for _ in 0..3 {
            vp.vanishing_lines.push(VanishingLine { axis, direction_px, weight: 1.0 });
        }
    }
    project.viewpoints.push(vp);

    // Synthesize observations against the pose and intrinsics the camera
    // will have *after* sanitisation (fx=fy=max_dim=1000, principal point
    // recentred, same orientation).
    let mut sanitized = identity_camera(Vector3::new(0.0, 0.0, -20.0), 1000, 1000);
    sanitized.pose.quaternion = q;
    for (i, p) in truth_points.iter().enumerate() {
        let (u, v) = project_point(&sanitized, *p);
        project.image_points.push(ImagePoint::new(i, 0, u, v));
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);

    let intr = &project.viewpoints[0].intrinsics;
    assert_eq!(intr.skew, 0.0);
    assert_eq!(intr.aspect_ratio, 1.0);
    assert!(intr.focal_length >= 0.3 * 1000.0 && intr.focal_length <= 5.0 * 1000.0, "focal length {}", intr.focal_length);
    assert!(result.median_reprojection_error < 10.0, "median error {}", result.median_reprojection_error);
}

/// Boundary: two uninitialisable cameras sharing too few points for
/// essential-matrix init, and no fully-constrained point for PnP, is a hard
/// precondition failure rather than a silent skip.
#[test]
fn too_few_shared_points_is_a_precondition_failure() {
    let mut project = Project::new();
    let points = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(1.0, 1.0, 0.0),
        Vector3::new(0.5, 0.5, 1.0),
    ];
    for _ in points {
        project.world_points.push(WorldPoint::free());
    }

    let cam_a = identity_camera(Vector3::new(0.0, 0.0, -10.0), 500, 500);
    let cam_b = identity_camera(Vector3::new(2.0, 0.0, -10.0), 500, 500);
    project.viewpoints.push(cam_a);
    project.viewpoints.push(cam_b);

    for (i, p) in points.iter().enumerate() {
        for cam in 0..2 {
            let (u, v) = project_point(&project.viewpoints[cam], *p);
            project.image_points.push(ImagePoint::new(i, cam, u, v));
        }
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(!result.converged);
    assert!(result.error.is_some());
    assert!(result.cameras_initialized.is_empty());
}

/// Boundary: a single fully-locked point and no axis constraints still
/// solves (world-axis interpretation is undefined, but LM still converges
/// on a valid least-squares minimum), and the underdetermined-gauge warning
/// is logged.
#[test]
fn single_locked_point_no_axis_constraints_still_converges_with_warning() {
    let mut project = Project::new();
    project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
    project.world_points.push(WorldPoint::free());
    project.world_points.push(WorldPoint::free());

    let mut vp = identity_camera(Vector3::new(0.0, 0.0, -20.0), 1000, 1000);
    vp.is_pose_locked = true;
    project.viewpoints.push(vp);

    let observed = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(3.0, 1.0, 2.0),
        Vector3::new(-2.0, 2.0, -1.0),
    ];
    for (i, p) in observed.iter().enumerate() {
        let (u, v) = project_point(&project.viewpoints[0], *p);
        project.image_points.push(ImagePoint::new(i, 0, u, v));
    }

    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);
    assert!(result.log.iter().any(|l| l.starts_with("[WARN]")), "log: {:?}", result.log);
}

/// Boundary: a camera with zero observations is dropped from the solve and
/// its pose is left untouched.
#[test]
fn zero_observation_camera_is_left_untouched() {
    let mut project = Project::new();
    project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
    let mut vp = Viewpoint::default();
    vp.pose.position = Vector3::new(1.0, 2.0, 3.0);
    project.viewpoints.push(vp);

    let before = project.viewpoints[0].pose.position;
    let result = pipeline::optimize(&mut project, &Options::default());
    assert!(result.converged, "log: {:?}", result.log);
    assert_eq!(project.viewpoints[0].pose.position, before);
}
