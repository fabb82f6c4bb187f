// ─────────────────────────────────────────────────────────────────────
// Gradspace — Random Rotations
// ─────────────────────────────────────────────────────────────────────
//! Uniformly distributed 3-D rotations.
//!
//! Q comes from the QR factorisation of a 3×3 standard-normal matrix with
//! R's diagonal made positive, which makes Q Haar-distributed on O(3).
//! Reflections (det Q = −1) are turned into rotations by negating the first
//! column. Points are row vectors: a rotated point is p·R.

use rand::Rng;
use rand_distr::StandardNormal;

use gradspace_types::Point3;

/// Row-major 3×3 rotation matrix.
pub type Rotation = [[f64; 3]; 3];

/// Mirror across the x = 0 plane.
const REFLECT_X: [f64; 3] = [-1.0, 1.0, 1.0];

/// Draw a rotation uniformly from SO(3).
pub fn random_rotation<R: Rng + ?Sized>(rng: &mut R) -> Rotation {
    loop {
        let mut g = [[0.0; 3]; 3];
        for row in g.iter_mut() {
            for v in row.iter_mut() {
                *v = rng.sample(StandardNormal);
            }
        }
        if let Some(mut q) = orthonormal_columns(&g) {
            if determinant(&q) < 0.0 {
                for row in q.iter_mut() {
                    row[0] = -row[0];
                }
            }
            return q;
        }
        log::debug!("degenerate gaussian draw for rotation, redrawing");
    }
}

/// Q of the Gram–Schmidt QR of `g` (R's diagonal positive).
/// `None` when the columns are numerically dependent.
fn orthonormal_columns(g: &[[f64; 3]; 3]) -> Option<Rotation> {
    let mut q = [[0.0; 3]; 3];
    for j in 0..3 {
        let mut col = [g[0][j], g[1][j], g[2][j]];
        for k in 0..j {
            let proj: f64 = (0..3).map(|i| q[i][k] * col[i]).sum();
            for (i, c) in col.iter_mut().enumerate() {
                *c -= proj * q[i][k];
            }
        }
        let norm = col.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm < 1e-12 {
            return None;
        }
        for i in 0..3 {
            q[i][j] = col[i] / norm;
        }
    }
    Some(q)
}

pub fn determinant(m: &Rotation) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// F·R·F with F = diag(−1, 1, 1): the mirror image of `r` for the
/// opposite hemisphere.
pub fn reflect_x(r: &Rotation) -> Rotation {
    let mut out = *r;
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v *= REFLECT_X[i] * REFLECT_X[j];
        }
    }
    out
}

/// p·R.
#[inline]
pub fn rotate(p: &Point3, r: &Rotation) -> Point3 {
    let mut out = [0.0; 3];
    for (j, o) in out.iter_mut().enumerate() {
        *o = p[0] * r[0][j] + p[1] * r[1][j] + p[2] * r[2][j];
    }
    out
}
