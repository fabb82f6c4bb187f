// ─────────────────────────────────────────────────────────────────────
// Gradspace — Geometry Collaborators
// ─────────────────────────────────────────────────────────────────────
//! Traits for the surface collaborators the null models consume, plus
//! vertex-mask helpers shared by every masked operation.

use sprs::CsMat;

use crate::error::{GradientError, GradientResult};

/// A vertex position in 3-D.
pub type Point3 = [f64; 3];

/// Cortical surface as seen by the null models.
///
/// Implementations live outside this workspace (mesh readers, parcellation
/// tooling); only vertex positions and ring distances are required.
pub trait SurfaceGeometry: Send + Sync {
    fn n_points(&self) -> usize;

    fn points(&self) -> &[Point3];

    /// Sparse geodesic-like distances between vertices up to `n_ring`
    /// edges apart.
    ///
    /// With a mask the result is restricted to the included vertices and
    /// indexed in their order (size = number of `true` entries).
    fn ring_distance(&self, n_ring: usize, mask: Option<&[bool]>) -> GradientResult<CsMat<f64>>;
}

/// Check a vertex mask against the expected vertex count.
pub fn check_mask(mask: &[bool], n: usize, what: &str) -> GradientResult<()> {
    if mask.len() != n {
        return Err(GradientError::shape(what, n, mask.len()));
    }
    if !mask.iter().any(|&m| m) {
        return Err(GradientError::InvalidInput(format!(
            "{what} excludes every vertex"
        )));
    }
    Ok(())
}

/// Indices of the included vertices, in order.
pub fn mask_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &keep)| keep.then_some(i))
        .collect()
}

/// Mask of the finite entries of a data vector.
pub fn finite_mask(data: &[f64]) -> Vec<bool> {
    data.iter().map(|v| v.is_finite()).collect()
}
