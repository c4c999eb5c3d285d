//! Pipeline orchestrator (spec §4.J): the only entry point a caller touches.
//!
//! `optimize()` walks the state machine {Idle, Init, Stage1, Realign, Stage2,
//! OutlierCheck, Rerun, Done, Failed} described in the spec, delegating to
//! every other component in turn. Nothing here does its own numerics; this
//! module is wiring.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::align;
use crate::error::Error;
use crate::init::{self, CameraInitReport};
use crate::lm::{self, LmOptions};
use crate::logger::{Logger, Tag};
use crate::outliers;
use crate::project::{Constraint, LineDirectionConstraint, Project};
use crate::residuals::{angle, coincident, collinear, coplanar, fixed_point, focal_reg, line_direction, line_length, point_reg, quat_norm, reprojection, vanishing, ysign, Row};
use crate::triangulate;
use crate::variables::{IntrinsicsPolicy, VariableLayout};

/// Weight and threshold for the optional Y-sign preservation residual (spec
/// §4.C, §9 "reflected-minimum attractors"). The spec leaves both unpinned;
/// threshold is scaled to the scene so it means roughly the same thing
/// regardless of whether the project is modelled in millimetres or metres.
const YSIGN_WEIGHT: f64 = 10.0;
const YSIGN_THRESHOLD_FACTOR: f64 = 0.5;

/// Caller-supplied knobs (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub auto_initialize_cameras: bool,
    pub auto_initialize_world_points: bool,
    pub detect_outliers: bool,
    /// The `k` in spec §4.I's median-robust threshold.
    pub outlier_threshold: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub damping: f64,
    pub optimize_camera_intrinsics: IntrinsicsPolicy,
    /// Candidate-initializer attempts at the orchestrator (spec §6); also
    /// caps the outlier-cascade re-solve to a single retry regardless of
    /// value, per spec §4.J step 8 ("re-solve once").
    pub max_attempts: usize,
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auto_initialize_cameras: true,
            auto_initialize_world_points: true,
            detect_outliers: true,
            outlier_threshold: 3.0,
            tolerance: 1e-6,
            max_iterations: 100,
            damping: 1e-3,
            optimize_camera_intrinsics: IntrinsicsPolicy::Auto,
            max_attempts: 3,
            verbose: false,
        }
    }
}

/// The outcome of one `optimize()` call (spec §4.J).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeResult {
    pub converged: bool,
    pub iterations: usize,
    pub residual: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cameras_initialized: Vec<String>,
    pub cameras_excluded: Vec<String>,
    pub outliers: Vec<usize>,
    pub median_reprojection_error: f64,
    /// Drained logger output (spec §6 "captured for diagnostic consumption").
    pub log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Init,
    Stage1,
    Realign,
    Stage2,
    OutlierCheck,
    Rerun,
    Done,
    Failed,
}

fn transition(state: &mut State, next: State) {
    tracing::debug!(from = ?*state, to = ?next, "pipeline state transition");
    *state = next;
}

fn camera_label(project: &Project, viewpoint: usize) -> String {
    project.viewpoints[viewpoint]
        .label
        .clone()
        .unwrap_or_else(|| format!("camera{viewpoint}"))
}

/// Reset the cached, solver-derived state every `optimize()` call starts from
/// (spec §4.J step 2): observation residuals and outlier flags always; world
/// point `optimized_xyz` and non-locked camera `is_initialized` only when
/// `autoInitializeCameras` is set, so repeated calls are idempotent rather
/// than accumulating stale state from a previous run. A pose-locked camera's
/// pose is supplied by the caller, not derived by an initializer, so it is
/// always treated as already initialised.
fn reset_cached_state(project: &mut Project, auto_initialize_cameras: bool, auto_initialize_world_points: bool) {
    for ip in &mut project.image_points {
        ip.last_residual = None;
        ip.is_outlier = false;
    }
    for wp in &mut project.world_points {
        wp.inferred_xyz = [None, None, None];
    }

    for vp in &mut project.viewpoints {
        if vp.is_pose_locked {
            vp.is_initialized = true;
        } else if auto_initialize_cameras {
            vp.is_initialized = false;
        }
    }

    if auto_initialize_cameras && auto_initialize_world_points {
        for wp in &mut project.world_points {
            wp.optimized_xyz = None;
        }
    }
}

/// World points observed by >= 2 enabled, initialised cameras (spec §4.J
/// Stage 1 / §4.G.1's "sufficient parallax" precondition, checked loosely
/// here on camera count alone — [`triangulate::multi_view_triangulate`]
/// itself rejects insufficient parallax at triangulation time).
fn multi_view_point_ids(project: &Project) -> HashSet<usize> {
    let mut counts = vec![0usize; project.world_points.len()];
    for ip in &project.image_points {
        let vp = &project.viewpoints[ip.viewpoint];
        if vp.enabled_in_solve && vp.is_initialized {
            counts[ip.world_point] += 1;
        }
    }
    counts.iter().enumerate().filter(|&(_, &c)| c >= 2).map(|(i, _)| i).collect()
}

/// Build the full residual-provider set for one LM pass, restricted to
/// points for which `include_point` returns true (spec §4.J Stage 1/2: Stage
/// 1 restricts to multi-view points and their incident constraints, the full
/// solve passes `|_| true`).
fn assemble_rows(layout: &VariableLayout, project: &Project, include_point: &dyn Fn(usize) -> bool) -> Vec<Row> {
    let mut rows = Vec::new();

    for (vp_id, vp) in project.viewpoints.iter().enumerate() {
        if !vp.enabled_in_solve || !vp.is_initialized {
            continue;
        }
        if let Some(q) = quat_norm::build(layout, project, vp_id) {
            rows.push(q);
        }
        if let Some([a, b]) = focal_reg::build(layout, project, vp_id) {
            rows.push(a);
            rows.push(b);
        }
        if let Some(r) = ysign::build(layout, project, vp_id, YSIGN_WEIGHT, YSIGN_THRESHOLD_FACTOR * scene_scale(project)) {
            rows.push(r);
        }
        for vl in &vp.vanishing_lines {
            if let Some(r) = vanishing::build(layout, project, vp_id, vl.axis, vl.direction_px, vl.weight) {
                rows.push(r);
            }
        }
    }

    for ip in &project.image_points {
        if ip.is_outlier || !include_point(ip.world_point) {
            continue;
        }
        let vp = &project.viewpoints[ip.viewpoint];
        if !vp.enabled_in_solve || !vp.is_initialized {
            continue;
        }
        let (u, v) = reprojection::build(layout, project, ip.world_point, ip.viewpoint, ip.observed_u, ip.observed_v);
        rows.push(u);
        rows.push(v);
    }

    for id in 0..project.world_points.len() {
        if !include_point(id) {
            continue;
        }
        rows.extend(point_reg::build(layout, project, id));
    }

    for line in &project.lines {
        if !include_point(line.point_a) || !include_point(line.point_b) {
            continue;
        }
        if let Some(target_length) = line.target_length {
            rows.push(line_length::build(layout, project, line.point_a, line.point_b, target_length));
        }
        if !matches!(line.direction, LineDirectionConstraint::Free) {
            rows.extend(line_direction::build(layout, project, line.point_a, line.point_b, line.direction));
        }
    }

    for constraint in &project.constraints {
        match constraint {
            Constraint::FixedPoint { point, target } => {
                if include_point(*point) {
                    rows.extend(fixed_point::build(layout, project, *point, *target));
                }
            }
            Constraint::Coplanar { points } => {
                if points.iter().all(|&p| include_point(p)) {
                    rows.extend(coplanar::build(layout, project, points));
                }
            }
            Constraint::Collinear { points } => {
                if points.iter().all(|&p| include_point(p)) {
                    rows.extend(collinear::build(layout, project, *points));
                }
            }
            Constraint::Coincident { point, a, b } => {
                if include_point(*point) && include_point(*a) && include_point(*b) {
                    rows.extend(coincident::build(layout, project, *point, *a, *b));
                }
            }
            Constraint::Angle { vertex, a, b, target_radians } => {
                if include_point(*vertex) && include_point(*a) && include_point(*b) {
                    rows.push(angle::build(layout, project, *vertex, *a, *b, *target_radians));
                }
            }
            Constraint::EqualDistances { pairs } => {
                if pairs.iter().all(|(a, b)| include_point(*a) && include_point(*b)) {
                    rows.extend(angle::build_equal_distances(layout, project, pairs));
                }
            }
            Constraint::EqualAngles { angles } => {
                if angles.iter().all(|(v, a, b)| include_point(*v) && include_point(*a) && include_point(*b)) {
                    rows.extend(angle::build_equal_angles(layout, project, angles));
                }
            }
        }
    }

    rows
}

fn scene_scale(project: &Project) -> f64 {
    project.lines.iter().filter_map(|l| l.target_length).fold(1.0_f64, f64::max)
}

/// Spec §5 "Scene gauge": unless >= 2 fully-locked points and >= 2 distinct
/// axis-aligned line directions are present, some combination of scale,
/// rotation, and translation remains unresolved by alignment. The solve
/// still runs and produces a valid converged result; only the world-axis
/// interpretation of that result is undefined.
fn warn_if_gauge_underdetermined(project: &Project, logger: &mut Logger) {
    let locked_points = project.world_points.iter().filter(|wp| wp.locked_xyz.iter().all(Option::is_some)).count();
    let distinct_axes: HashSet<usize> = project
        .lines
        .iter()
        .filter_map(|l| match l.direction {
            LineDirectionConstraint::Axis(a) => Some(a.index()),
            _ => None,
        })
        .collect();
    if locked_points < 2 || distinct_axes.len() < 2 {
        logger.log(Tag::Warn, "scene gauge underdetermined: fewer than 2 locked points and/or 2 axis-aligned line directions; orientation/scale of the result is not uniquely fixed".to_string());
    }
}

/// Run one LM pass over `rows` and write the result back into `project`
/// (spec §4.J step 9, done at each stage boundary rather than only at the
/// very end, matching "written back... at each outer iteration boundary",
/// spec §3 `WorldPoint` lifecycle note).
fn run_solve(layout: &VariableLayout, project: &mut Project, rows: &[Row], options: &Options, logger: &mut Logger) -> lm::LmResult {
    let lm_options = LmOptions {
        tolerance: options.tolerance,
        max_iterations: options.max_iterations,
        initial_damping: options.damping,
        max_attempts: options.max_attempts,
    };
    let result = lm::optimize(layout.n(), rows, layout.initial(), &lm_options, logger);
    layout.write_back(project, &result.x);
    result
}

fn reports_to_labels(project: &Project, reports: &[CameraInitReport]) -> Vec<String> {
    reports.iter().filter(|r| r.succeeded).map(|r| camera_label(project, r.viewpoint)).collect()
}

fn observed_camera_count(project: &Project) -> usize {
    (0..project.viewpoints.len())
        .filter(|&i| project.image_points.iter().any(|ip| ip.viewpoint == i))
        .count()
}

/// Entry point (spec §4.J). Consumes `project` by mutable reference, runs
/// the full orchestration, and returns a structured result. The only failure
/// mode that does not produce a pose write-back is a hard precondition
/// failure (spec §4.J "Failed" state / §7 "precondition failure").
pub fn optimize(project: &mut Project, options: &Options) -> OptimizeResult {
    let mut logger = Logger::new(options.verbose);
    let mut state = State::Idle;

    transition(&mut state, State::Init);
    project.validate();
    reset_cached_state(project, options.auto_initialize_cameras, options.auto_initialize_world_points);
    project.propagate_inferences();

    let mut cameras_initialized = Vec::new();
    let mut em_used = false;
    let mut pnp_used = false;

    if options.auto_initialize_cameras {
        let reports = init::initialize_cameras(project, &mut logger);
        em_used = reports.iter().any(|r| r.method == "essential" && r.succeeded);
        pnp_used = reports.iter().any(|r| r.method == "pnp" && r.succeeded);
        cameras_initialized.extend(reports_to_labels(project, &reports));
    }

    if let Err(message) = check_hard_preconditions(project) {
        transition(&mut state, State::Failed);
        logger.log(Tag::Warn, message.clone());
        return OptimizeResult {
            converged: false,
            iterations: 0,
            residual: 0.0,
            error: Some(message),
            cameras_initialized,
            cameras_excluded: Vec::new(),
            outliers: Vec::new(),
            median_reprojection_error: 0.0,
            log: logger.drain(),
        };
    }

    warn_if_gauge_underdetermined(project, &mut logger);

    transition(&mut state, State::Realign);
    if options.auto_initialize_world_points {
        triangulate::initialize_world_points(project, &mut logger);

        let has_axis_constraints = project.lines.iter().any(|l| matches!(l.direction, LineDirectionConstraint::Axis(_)));
        if em_used && !has_axis_constraints {
            logger.log(Tag::Scale, "essential-matrix init with no axis constraints: running a preliminary free solve before alignment".to_string());
            let layout = VariableLayout::build(project, options.optimize_camera_intrinsics);
            let rows = assemble_rows(&layout, project, &|_| true);
            run_solve(&layout, project, &rows, options, &mut logger);
        }

        align::axis_align(project);
        // PnP already recovers true-scale poses directly from locked points;
        // a full 7-DoF similarity fit would needlessly re-rotate/re-translate
        // an already-correct frame, so only nudge scale (spec §4.H "PnP
        // path"). VP/EM-initialised scenes have no such anchor and need the
        // full fit.
        if pnp_used && !em_used {
            align::scale_only_correction(project);
        } else {
            align::similarity_align_to_locked_points(project);
        }
        project.propagate_inferences();
    }

    let late_reports = init::late_pnp(project, &mut logger);
    cameras_initialized.extend(reports_to_labels(project, &late_reports));
    let late_pnp_viewpoints: Vec<usize> = late_reports.iter().filter(|r| r.succeeded).map(|r| r.viewpoint).collect();

    transition(&mut state, State::Stage1);
    let stage1_layout = VariableLayout::build(project, options.optimize_camera_intrinsics);
    let multi_view = multi_view_point_ids(project);
    let stage1_rows = assemble_rows(&stage1_layout, project, &|id| multi_view.contains(&id));
    logger.log(Tag::Stage1, format!("stage 1: {} points, {} rows", multi_view.len(), stage1_rows.len()));
    run_solve(&stage1_layout, project, &stage1_rows, options, &mut logger);

    if options.auto_initialize_world_points {
        triangulate::initialize_world_points(project, &mut logger);
        project.propagate_inferences();
    }

    transition(&mut state, State::Stage2);
    let layout = VariableLayout::build(project, options.optimize_camera_intrinsics);
    let rows = assemble_rows(&layout, project, &|_| true);
    logger.log(Tag::Solve, format!("full solve: {} rows", rows.len()));
    let mut result = run_solve(&layout, project, &rows, options, &mut logger);

    let mut cameras_excluded = Vec::new();
    let mut outlier_result = outliers::OutlierResult { median_error: 0.0, threshold: 0.0, outlier_indices: Vec::new() };

    if options.detect_outliers {
        transition(&mut state, State::OutlierCheck);
        outlier_result = outliers::detect(project, options.outlier_threshold);
        logger.log(
            Tag::Outliers,
            format!("{} outliers flagged (median {:.2}px, threshold {:.2}px)", outlier_result.outlier_indices.len(), outlier_result.median_error, outlier_result.threshold),
        );

        let cascade = outliers::cascade_candidates(project, &late_pnp_viewpoints);
        if !cascade.is_empty() {
            transition(&mut state, State::Rerun);
            for &vp in &cascade {
                project.viewpoints[vp].enabled_in_solve = false;
                cameras_excluded.push(camera_label(project, vp));
                logger.log(Tag::Rerun, format!("excluding camera {} (100% outlier after late PnP) and re-solving", camera_label(project, vp)));
            }

            let layout = VariableLayout::build(project, options.optimize_camera_intrinsics);
            let rows = assemble_rows(&layout, project, &|_| true);
            result = run_solve(&layout, project, &rows, options, &mut logger);
            outlier_result = outliers::detect(project, options.outlier_threshold);
        }
    } else {
        outliers::compute_residuals(project);
    }

    transition(&mut state, State::Done);

    OptimizeResult {
        converged: result.converged,
        iterations: result.iterations,
        residual: result.cost,
        error: result.error.as_ref().map(Error::to_string),
        cameras_initialized,
        cameras_excluded,
        outliers: outlier_result.outlier_indices,
        median_reprojection_error: outlier_result.median_error,
        log: logger.drain(),
    }
}

/// Spec §4.J "Failed" state / §7 "precondition failure": a camera that is
/// observed but could not be initialised by any strategy, with no remaining
/// path (no other uninitialised camera to pair it with for essential-matrix,
/// and too few points for PnP) is a hard failure, not a per-camera skip.
fn check_hard_preconditions(project: &Project) -> std::result::Result<(), String> {
    let observed = observed_camera_count(project);
    let initialized = project.viewpoints.iter().filter(|vp| vp.enabled_in_solve && vp.is_initialized).count();
    if observed > 0 && initialized == 0 {
        return Err(format!(
            "no camera could be initialised: {observed} observed camera(s) each lack >=2 distinct vanishing axes, >=3 fully-constrained points, and a partner with >=7 shared points"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ImagePoint, Pose, Viewpoint, WorldPoint};
    use nalgebra::{Vector3, Vector4};

    fn camera_at(position: Vector3<f64>) -> Viewpoint {
        let mut vp = Viewpoint::default();
        vp.pose = Pose { position, quaternion: Vector4::new(1.0, 0.0, 0.0, 0.0) };
        vp
    }

    #[test]
    fn simple_pnp_scenario_converges() {
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
        let mut vp = camera_at(truth_pose.position);
        vp.intrinsics.principal_point = (500.0, 500.0);
        project.viewpoints.push(vp);

        for (i, p) in truth_points.iter().enumerate() {
            let rel = p - truth_pose.position;
            let u = project.viewpoints[0].intrinsics.fx() * (rel.x / rel.z) + 500.0;
            let v = 500.0 - project.viewpoints[0].intrinsics.fy() * (rel.y / rel.z);
            project.image_points.push(ImagePoint::new(i, 0, u, v));
        }

        let options = Options::default();
        let result = optimize(&mut project, &options);
        assert!(result.converged);
        assert!(result.median_reprojection_error < 2.0);
        approx::assert_relative_eq!(project.viewpoints[0].pose.position, truth_pose.position, epsilon = 0.5);
    }

    #[test]
    fn zero_observation_camera_is_untouched() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
        let mut vp = Viewpoint::default();
        vp.pose.position = Vector3::new(1.0, 2.0, 3.0);
        project.viewpoints.push(vp);

        let options = Options::default();
        let before = project.viewpoints[0].pose.position;
        let _ = optimize(&mut project, &options);
        assert_eq!(project.viewpoints[0].pose.position, before);
    }
}
