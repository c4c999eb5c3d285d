//! Variable layout: entity ↔ flat vector index mapping (spec §4.B).
//!
//! This is the "single owner of the ID → index map" of spec §9's
//! arena-plus-indices design note. Entity identity is just the entity's
//! position in `Project`'s vectors; `VariableLayout` maps each (entity,
//! axis) pair to either a slot in the flat `x: DVector<f64>` the LM driver
//! optimizes, or `None` when that coordinate is locked, inferred, or the
//! camera/quaternion/intrinsic is not part of the solve (spec's `-1`
//! sentinel, expressed idiomatically as `Option<usize>`).

use nalgebra::{DVector, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::project::Project;

/// Policy for optimizing a camera's focal length (spec §4.B, §6 `optimizeCameraIntrinsics`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntrinsicsPolicy {
    Always,
    Never,
    /// Free iff the camera has zero vanishing-line annotations.
    Auto,
}

impl Default for IntrinsicsPolicy {
    fn default() -> Self {
        IntrinsicsPolicy::Auto
    }
}

#[derive(Debug, Clone)]
pub struct VariableLayout {
    n: usize,
    initial: DVector<f64>,
    world_point_idx: Vec<[Option<usize>; 3]>,
    camera_pos_idx: Vec<[Option<usize>; 3]>,
    camera_quat_idx: Vec<Option<[usize; 4]>>,
    camera_focal_idx: Vec<Option<usize>>,
}

impl VariableLayout {
    pub fn build(project: &Project, intrinsics_policy: IntrinsicsPolicy) -> Self {
        let mut initial = Vec::new();
        let mut world_point_idx = Vec::with_capacity(project.world_points.len());

        for wp in &project.world_points {
            let mut slots = [None; 3];
            for axis in 0..3 {
                if wp.locked_xyz[axis].is_none() && wp.inferred_xyz[axis].is_none() {
                    let value = wp.optimized_xyz.map(|p| p[axis]).unwrap_or(0.0);
                    slots[axis] = Some(initial.len());
                    initial.push(value);
                }
            }
            world_point_idx.push(slots);
        }

        let mut camera_pos_idx = Vec::with_capacity(project.viewpoints.len());
        let mut camera_quat_idx = Vec::with_capacity(project.viewpoints.len());
        let mut camera_focal_idx = Vec::with_capacity(project.viewpoints.len());

        for vp in &project.viewpoints {
            if !vp.enabled_in_solve {
                camera_pos_idx.push([None; 3]);
                camera_quat_idx.push(None);
                camera_focal_idx.push(None);
                continue;
            }

            if vp.is_pose_locked {
                camera_pos_idx.push([None; 3]);
                camera_quat_idx.push(None);
            } else {
                let mut slots = [None; 3];
                for (axis, slot) in slots.iter_mut().enumerate() {
                    *slot = Some(initial.len());
                    initial.push(vp.pose.position[axis]);
                }
                camera_pos_idx.push(slots);

                let base = initial.len();
                initial.push(vp.pose.quaternion[0]);
                initial.push(vp.pose.quaternion[1]);
                initial.push(vp.pose.quaternion[2]);
                initial.push(vp.pose.quaternion[3]);
                camera_quat_idx.push(Some([base, base + 1, base + 2, base + 3]));
            }

            let free_focal = match intrinsics_policy {
                IntrinsicsPolicy::Always => true,
                IntrinsicsPolicy::Never => false,
                IntrinsicsPolicy::Auto => vp.vanishing_lines.is_empty(),
            };
            if free_focal {
                camera_focal_idx.push(Some(initial.len()));
                initial.push(vp.intrinsics.focal_length);
            } else {
                camera_focal_idx.push(None);
            }
        }

        Self {
            n: initial.len(),
            initial: DVector::from_vec(initial),
            world_point_idx,
            camera_pos_idx,
            camera_quat_idx,
            camera_focal_idx,
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn initial(&self) -> &DVector<f64> {
        &self.initial
    }

    pub fn world_point_idx(&self, id: usize) -> [Option<usize>; 3] {
        self.world_point_idx[id]
    }

    pub fn camera_pos_idx(&self, id: usize) -> [Option<usize>; 3] {
        self.camera_pos_idx[id]
    }

    pub fn camera_quat_idx(&self, id: usize) -> Option<[usize; 4]> {
        self.camera_quat_idx[id]
    }

    pub fn camera_focal_idx(&self, id: usize) -> Option<usize> {
        self.camera_focal_idx[id]
    }

    /// The value to inline for a locked/inferred world-point axis (spec §4.B
    /// `locked_value`). Falls back to `0.0` only if the axis is neither
    /// locked, inferred, nor optimized — callers should not reach this for
    /// entities that pass [`Project::validate`]'s reachability expectations.
    pub fn locked_value(&self, project: &Project, world_point: usize, axis: usize) -> f64 {
        project.world_points[world_point].effective_xyz(axis).unwrap_or(0.0)
    }

    /// Read a world point's current position, whether free (from `x`) or
    /// fixed (from the project entity). Used once at provider-construction
    /// time and by the accumulator to report `optimizedXyz` back; providers
    /// themselves pull free coordinates straight out of `x` by index.
    pub fn effective_world_point(&self, project: &Project, x: &DVector<f64>, id: usize) -> Vector3<f64> {
        let idx = self.world_point_idx[id];
        let mut p = Vector3::zeros();
        for axis in 0..3 {
            p[axis] = match idx[axis] {
                Some(i) => x[i],
                None => project.world_points[id].effective_xyz(axis).unwrap_or(0.0),
            };
        }
        p
    }

    pub fn effective_camera_position(&self, project: &Project, x: &DVector<f64>, id: usize) -> Vector3<f64> {
        let idx = self.camera_pos_idx[id];
        let mut p = Vector3::zeros();
        for axis in 0..3 {
            p[axis] = match idx[axis] {
                Some(i) => x[i],
                None => project.viewpoints[id].pose.position[axis],
            };
        }
        p
    }

    pub fn effective_camera_quaternion(&self, project: &Project, x: &DVector<f64>, id: usize) -> Vector4<f64> {
        match self.camera_quat_idx[id] {
            Some(idx) => Vector4::new(x[idx[0]], x[idx[1]], x[idx[2]], x[idx[3]]),
            None => project.viewpoints[id].pose.quaternion,
        }
    }

    pub fn effective_focal(&self, project: &Project, x: &DVector<f64>, id: usize) -> f64 {
        match self.camera_focal_idx[id] {
            Some(i) => x[i],
            None => project.viewpoints[id].intrinsics.focal_length,
        }
    }

    /// Write optimized positions, poses, and focal lengths back into the
    /// project entities (spec §6, §4.J step 9). Leaves locked/disabled
    /// fields untouched.
    pub fn write_back(&self, project: &mut Project, x: &DVector<f64>) {
        for id in 0..project.world_points.len() {
            let idx = self.world_point_idx[id];
            if idx.iter().all(Option::is_none) {
                continue;
            }
            let p = self.effective_world_point(project, x, id);
            project.world_points[id].optimized_xyz = Some([p.x, p.y, p.z]);
        }
        for id in 0..project.viewpoints.len() {
            if self.camera_pos_idx[id].iter().any(Option::is_some) {
                project.viewpoints[id].pose.position = self.effective_camera_position(project, x, id);
            }
            if self.camera_quat_idx[id].is_some() {
                project.viewpoints[id].pose.quaternion = self.effective_camera_quaternion(project, x, id);
            }
            if let Some(i) = self.camera_focal_idx[id] {
                project.viewpoints[id].intrinsics.focal_length = x[i];
            }
        }
    }
}
