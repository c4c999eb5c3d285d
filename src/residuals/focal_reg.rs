//! Focal-length regularization residual (spec §4.C): two one-sided hinge
//! penalties keeping a free focal length inside `[0.3·maxDim, 5.0·maxDim]`.

use nalgebra::DVector;

use crate::project::Project;
use crate::residuals::Row;
use crate::variables::VariableLayout;

const WEIGHT: f64 = 500.0;
const MIN_FACTOR: f64 = 0.3;
const MAX_FACTOR: f64 = 5.0;

/// Returns `None` when the camera's focal length is not a free variable
/// (nothing to regularize).
pub fn build(layout: &VariableLayout, project: &Project, viewpoint: usize) -> Option<[Row; 2]> {
    let idx = layout.camera_focal_idx(viewpoint)?;
    let max_dim = project.viewpoints[viewpoint].max_dim();
    let min_f = MIN_FACTOR * max_dim;
    let max_f = MAX_FACTOR * max_dim;

    let low = Row::new(vec![crate::residuals::Coord::free(idx)], move |x: &DVector<f64>| {
        let f = x[idx];
        let arg = (min_f - f) / max_dim;
        if arg > 0.0 {
            (WEIGHT * arg, vec![-WEIGHT / max_dim])
        } else {
            (0.0, vec![0.0])
        }
    });

    let high = Row::new(vec![crate::residuals::Coord::free(idx)], move |x: &DVector<f64>| {
        let f = x[idx];
        let arg = (f - max_f) / max_dim;
        if arg > 0.0 {
            (WEIGHT * arg, vec![WEIGHT / max_dim])
        } else {
            (0.0, vec![0.0])
        }
    });

    Some([low, high])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Viewpoint;
    use crate::residuals::ResidualRow;
    use crate::variables::IntrinsicsPolicy;
    use approx::assert_relative_eq;

    #[test]
    fn penalty_is_zero_inside_range() {
        let mut project = Project::new();
        let mut vp = Viewpoint::default();
        vp.width = 1000;
        vp.height = 1000;
        vp.intrinsics.focal_length = 1000.0;
        project.viewpoints.push(vp);
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Always);
        let x = layout.initial().clone();
        let [low, high] = build(&layout, &project, 0).unwrap();
        assert_relative_eq!(low.residual(&x), 0.0);
        assert_relative_eq!(high.residual(&x), 0.0);
    }

    #[test]
    fn penalty_activates_below_min() {
        let mut project = Project::new();
        let mut vp = Viewpoint::default();
        vp.width = 1000;
        vp.height = 1000;
        vp.intrinsics.focal_length = 100.0; // below 0.3*1000 = 300
        project.viewpoints.push(vp);
        let layout = VariableLayout::build(&project, IntrinsicsPolicy::Always);
        let x = layout.initial().clone();
        let [low, high] = build(&layout, &project, 0).unwrap();
        assert!(low.residual(&x) > 0.0);
        assert_relative_eq!(high.residual(&x), 0.0);
        assert_eq!(low.variable_indices().len(), 1);
    }
}
