//! The entity graph the solver operates on (spec §3, §6).
//!
//! This is the "Project API consumed by the core": a plain data structure
//! the caller builds, hands to [`crate::pipeline::optimize`] by mutable
//! reference, and reads back afterwards. There is no trait-object boundary
//! here — the `Project` the orchestrator validates in `optimize()` is the
//! same struct used to hold the caller's own project state, matching spec
//! §7's "Caller misuse (a non-project object passed in): panic/abort with a
//! clear message" (there is no type-erased object to misuse in Rust, so this
//! reduces to asserting the graph's indices are internally consistent).

use nalgebra::{Vector3, Vector4};

use crate::geometry::Distortion;

/// One of the three world axes, used by vanishing-line annotations and
/// axis-aligned line constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn unit_vector(self) -> Vector3<f64> {
        match self {
            Axis::X => Vector3::x(),
            Axis::Y => Vector3::y(),
            Axis::Z => Vector3::z(),
        }
    }

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// A reconstructed or user-anchored 3D point (spec §3 `WorldPoint`).
#[derive(Debug, Clone, Default)]
pub struct WorldPoint {
    /// Per-axis hard lock. A locked coordinate never appears as a free
    /// variable (spec §3 invariant); its value is inlined at residual
    /// evaluation.
    pub locked_xyz: [Option<f64>; 3],
    /// Per-axis value derived from constraints (e.g. lying on an
    /// axis-aligned line rooted at a locked point). Recomputed synchronously
    /// at the start of every `optimize()` call; never written during LM
    /// iterations.
    pub inferred_xyz: [Option<f64>; 3],
    /// Current solver estimate, written back at convergence (and at each
    /// outer iteration boundary).
    pub optimized_xyz: Option<[f64; 3]>,
    /// Optional human-readable label (e.g. an AprilTag ID).
    pub label: Option<String>,
}

impl WorldPoint {
    pub fn locked(xyz: [f64; 3]) -> Self {
        Self {
            locked_xyz: [Some(xyz[0]), Some(xyz[1]), Some(xyz[2])],
            ..Default::default()
        }
    }

    pub fn free() -> Self {
        Self::default()
    }

    /// `effectiveXyz[i] = lockedXyz[i] ?? inferredXyz[i] ?? optimizedXyz[i]`.
    pub fn effective_xyz(&self, axis: usize) -> Option<f64> {
        self.locked_xyz[axis]
            .or(self.inferred_xyz[axis])
            .or(self.optimized_xyz.map(|p| p[axis]))
    }

    pub fn effective_point(&self) -> Option<Vector3<f64>> {
        let x = self.effective_xyz(0)?;
        let y = self.effective_xyz(1)?;
        let z = self.effective_xyz(2)?;
        Some(Vector3::new(x, y, z))
    }

    /// "Fully constrained" per spec §3: all three axes are locked or inferred
    /// (an `optimized_xyz` alone does not count).
    pub fn is_fully_constrained(&self) -> bool {
        (0..3).all(|i| self.locked_xyz[i].or(self.inferred_xyz[i]).is_some())
    }

    pub fn determined_point(&self) -> Option<Vector3<f64>> {
        if !self.is_fully_constrained() {
            return None;
        }
        self.effective_point()
    }
}

/// Camera intrinsic parameters (spec §3 `Viewpoint`).
#[derive(Debug, Clone, Copy)]
pub struct Intrinsics {
    pub focal_length: f64,
    pub aspect_ratio: f64,
    pub principal_point: (f64, f64),
    pub skew: f64,
    pub distortion: Distortion,
}

impl Intrinsics {
    pub fn fx(&self) -> f64 {
        self.focal_length
    }
    pub fn fy(&self) -> f64 {
        self.focal_length * self.aspect_ratio
    }
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            focal_length: 1000.0,
            aspect_ratio: 1.0,
            principal_point: (0.0, 0.0),
            skew: 0.0,
            distortion: Distortion::default(),
        }
    }
}

/// Camera extrinsic pose: position plus a (not-necessarily-unit) quaternion
/// `[w, x, y, z]` (spec §3, §9 "quaternion non-unit safety").
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub quaternion: Vector4<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            quaternion: Vector4::new(1.0, 0.0, 0.0, 0.0),
        }
    }
}

/// A 2D line annotation tagged with the world axis it is believed to be the
/// vanishing point of (spec §3, §4.F).
#[derive(Debug, Clone, Copy)]
pub struct VanishingLine {
    pub axis: Axis,
    /// A normalized 2D direction in (distorted) pixel coordinates, e.g. the
    /// direction between the two endpoints of the annotated line segment.
    pub direction_px: (f64, f64),
    pub weight: f64,
}

/// A calibrated (or to-be-calibrated) camera (spec §3 `Viewpoint`).
#[derive(Debug, Clone)]
pub struct Viewpoint {
    pub width: usize,
    pub height: usize,
    pub intrinsics: Intrinsics,
    pub pose: Pose,
    pub vanishing_lines: Vec<VanishingLine>,
    pub is_pose_locked: bool,
    pub enabled_in_solve: bool,
    /// Set by the orchestrator once an initializer has produced a pose for
    /// this camera; cleared on reset.
    pub is_initialized: bool,
    /// Optional human-readable label, surfaced in `OptimizeResult` reporting
    /// (e.g. `cameras_excluded`) in place of a bare index.
    pub label: Option<String>,
}

impl Default for Viewpoint {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            intrinsics: Intrinsics::default(),
            pose: Pose::default(),
            vanishing_lines: Vec::new(),
            is_pose_locked: false,
            enabled_in_solve: true,
            is_initialized: false,
            label: None,
        }
    }
}

impl Viewpoint {
    pub fn max_dim(&self) -> f64 {
        self.width.max(self.height) as f64
    }
}

/// One 2D observation of a world point in a viewpoint (spec §3 `ImagePoint`).
#[derive(Debug, Clone)]
pub struct ImagePoint {
    pub world_point: usize,
    pub viewpoint: usize,
    pub observed_u: f64,
    pub observed_v: f64,
    pub is_outlier: bool,
    pub last_residual: Option<(f64, f64)>,
}

impl ImagePoint {
    pub fn new(world_point: usize, viewpoint: usize, u: f64, v: f64) -> Self {
        Self {
            world_point,
            viewpoint,
            observed_u: u,
            observed_v: v,
            is_outlier: false,
            last_residual: None,
        }
    }
}

/// How a [`Line`] constrains the direction between its two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirectionConstraint {
    Axis(Axis),
    Plane(Axis, Axis),
    Free,
}

/// A constraint-bearing line between two world points (spec §3 `Line`).
#[derive(Debug, Clone)]
pub struct Line {
    pub point_a: usize,
    pub point_b: usize,
    pub target_length: Option<f64>,
    pub direction: LineDirectionConstraint,
}

/// Polymorphic geometric constraints (spec §3 `Constraint`), represented as
/// a tagged variant rather than a trait object per the "sum types instead of
/// inheritance" redesign note in spec §9.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Soft per-axis target, distinct from [`WorldPoint::locked_xyz`]: this
    /// contributes a residual rather than removing the point from the
    /// variable layout.
    FixedPoint {
        point: usize,
        target: [Option<f64>; 3],
    },
    /// `points.len() >= 4`; see spec §4.C "rotating base" coplanarity.
    Coplanar { points: Vec<usize> },
    Collinear {
        points: [usize; 3],
    },
    /// `point` lies on the line through `a`–`b`.
    Coincident {
        point: usize,
        a: usize,
        b: usize,
    },
    Angle {
        vertex: usize,
        a: usize,
        b: usize,
        target_radians: f64,
    },
    EqualDistances {
        pairs: Vec<(usize, usize)>,
    },
    EqualAngles {
        angles: Vec<(usize, usize, usize)>,
    },
}

/// The entity graph passed into [`crate::pipeline::optimize`].
#[derive(Debug, Clone, Default)]
pub struct Project {
    pub world_points: Vec<WorldPoint>,
    pub viewpoints: Vec<Viewpoint>,
    pub image_points: Vec<ImagePoint>,
    pub lines: Vec<Line>,
    pub constraints: Vec<Constraint>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts that every index referenced by an [`ImagePoint`], [`Line`], or
    /// [`Constraint`] names a real entity. This is the "caller misuse" guard
    /// of spec §7 — it panics rather than returning an [`crate::error::Error`],
    /// because a dangling index is a programming bug, not runtime data.
    pub fn validate(&self) {
        let np = self.world_points.len();
        let nv = self.viewpoints.len();
        for (i, ip) in self.image_points.iter().enumerate() {
            assert!(ip.world_point < np, "image_point[{i}].world_point out of range");
            assert!(ip.viewpoint < nv, "image_point[{i}].viewpoint out of range");
        }
        for (i, l) in self.lines.iter().enumerate() {
            assert!(l.point_a < np, "lines[{i}].point_a out of range");
            assert!(l.point_b < np, "lines[{i}].point_b out of range");
        }
        for (i, c) in self.constraints.iter().enumerate() {
            let check = |idx: usize| assert!(idx < np, "constraints[{i}] references out-of-range point {idx}");
            match c {
                Constraint::FixedPoint { point, .. } => check(*point),
                Constraint::Coplanar { points } => {
                    assert!(points.len() >= 4, "constraints[{i}] Coplanar needs >= 4 points");
                    points.iter().copied().for_each(check);
                }
                Constraint::Collinear { points } => points.iter().copied().for_each(check),
                Constraint::Coincident { point, a, b } => {
                    check(*point);
                    check(*a);
                    check(*b);
                }
                Constraint::Angle { vertex, a, b, .. } => {
                    check(*vertex);
                    check(*a);
                    check(*b);
                }
                Constraint::EqualDistances { pairs } => {
                    for (a, b) in pairs {
                        check(*a);
                        check(*b);
                    }
                }
                Constraint::EqualAngles { angles } => {
                    for (v, a, b) in angles {
                        check(*v);
                        check(*a);
                        check(*b);
                    }
                }
            }
        }
    }

    /// Recompute `inferred_xyz` for every world point from `lines` and
    /// `constraints` (spec §3 "recomputed synchronously at the start of each
    /// solve"), called exactly once per `optimize()` (spec §6).
    ///
    /// This is a fixed-point propagation: starting from locked points, walk
    /// axis-aligned, length-bearing [`Line`]s outward ("a chain of
    /// direction-constrained lines from a locked root", spec §4.G.3) until no
    /// further point gains a fully-determined position.
    pub fn propagate_inferences(&mut self) {
        for wp in &mut self.world_points {
            wp.inferred_xyz = [None, None, None];
        }

        let max_rounds = self.world_points.len() + self.lines.len() + 1;
        for _ in 0..max_rounds {
            let mut changed = false;
            for line in &self.lines {
                let axis = match line.direction {
                    LineDirectionConstraint::Axis(a) => a,
                    _ => continue,
                };
                let Some(length) = line.target_length else {
                    continue;
                };
                changed |= self.propagate_axis_line(line.point_a, line.point_b, axis, length);
                changed |= self.propagate_axis_line(line.point_b, line.point_a, axis, -length);
            }
            if !changed {
                break;
            }
        }
    }

    /// If `from` is fully determined and `to` is not, set `to`'s inferred
    /// position to `from + signed_length` along `axis`. Returns whether `to`
    /// changed.
    fn propagate_axis_line(&mut self, from: usize, to: usize, axis: Axis, signed_length: f64) -> bool {
        let Some(origin) = self.world_points[from].determined_point() else {
            return false;
        };
        if self.world_points[to].is_fully_constrained() {
            return false;
        }
        let mut target = origin;
        target[axis.index()] += signed_length;
        let wp = &mut self.world_points[to];
        let mut changed = false;
        for i in 0..3 {
            if wp.locked_xyz[i].is_none() && wp.inferred_xyz[i] != Some(target[i]) {
                wp.inferred_xyz[i] = Some(target[i]);
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagate_inferences_walks_axis_chain() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
        project.world_points.push(WorldPoint::free());
        project.world_points.push(WorldPoint::free());
        project.lines.push(Line {
            point_a: 0,
            point_b: 1,
            target_length: Some(5.0),
            direction: LineDirectionConstraint::Axis(Axis::X),
        });
        project.lines.push(Line {
            point_a: 1,
            point_b: 2,
            target_length: Some(3.0),
            direction: LineDirectionConstraint::Axis(Axis::Z),
        });

        project.propagate_inferences();

        assert_eq!(project.world_points[1].effective_point(), Some(Vector3::new(5.0, 0.0, 0.0)));
        assert_eq!(project.world_points[2].effective_point(), Some(Vector3::new(5.0, 0.0, 3.0)));
    }

    #[test]
    fn validate_passes_on_consistent_graph() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
        project.viewpoints.push(Viewpoint::default());
        project.image_points.push(ImagePoint::new(0, 0, 1.0, 1.0));
        project.validate();
    }

    #[test]
    #[should_panic]
    fn validate_panics_on_dangling_index() {
        let mut project = Project::new();
        project.world_points.push(WorldPoint::locked([0.0, 0.0, 0.0]));
        project.viewpoints.push(Viewpoint::default());
        project.image_points.push(ImagePoint::new(7, 0, 1.0, 1.0));
        project.validate();
    }
}
