// ─────────────────────────────────────────────────────────────────────
// Gradspace — Graph Laplacians
// ─────────────────────────────────────────────────────────────────────
//! Degree, symmetry and connectivity helpers plus Laplacian builders.
//!
//! Isolated vertices (degree below the floor) get zero rows and columns in
//! the normalised operators instead of a division by zero.

use std::collections::VecDeque;

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Degree floor below which a vertex counts as isolated.
pub const DEGREE_FLOOR: f64 = 1e-12;

/// Row sums.
pub fn degrees(w: ArrayView2<f64>) -> Array1<f64> {
    w.sum_axis(Axis(1))
}

/// Symmetric within `tol` times the largest absolute entry.
pub fn is_symmetric(w: ArrayView2<f64>, tol: f64) -> bool {
    let (n, m) = w.dim();
    if n != m {
        return false;
    }
    let scale = w.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(1.0);
    for i in 0..n {
        for j in (i + 1)..n {
            if (w[[i, j]] - w[[j, i]]).abs() > tol * scale {
                return false;
            }
        }
    }
    true
}

/// (W + Wᵀ) / 2.
pub fn symmetrize_average(w: ArrayView2<f64>) -> Array2<f64> {
    (&w + &w.t()) * 0.5
}

/// True when every vertex is reachable through nonzero edges
/// (direction ignored).
pub fn is_connected(w: ArrayView2<f64>) -> bool {
    let n = w.nrows();
    if n == 0 {
        return true;
    }
    let mut seen = vec![false; n];
    let mut queue = VecDeque::from([0usize]);
    seen[0] = true;
    let mut count = 1;
    while let Some(i) = queue.pop_front() {
        for j in 0..n {
            if !seen[j] && (w[[i, j]] != 0.0 || w[[j, i]] != 0.0) {
                seen[j] = true;
                count += 1;
                queue.push_back(j);
            }
        }
    }
    count == n
}

/// D^{-1/2} W D^{-1/2} together with √d (floored to zero for isolated vertices).
pub fn normalized_adjacency(w: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let d = degrees(w);
    let isolated = d.iter().filter(|&&v| v <= DEGREE_FLOOR).count();
    if isolated > 0 {
        log::warn!("{isolated} isolated vertices in affinity graph; their rows are zeroed");
    }
    let d_inv_sqrt = d.mapv(|v| if v > DEGREE_FLOOR { 1.0 / v.sqrt() } else { 0.0 });
    let sqrt_d = d.mapv(|v| if v > DEGREE_FLOOR { v.sqrt() } else { 0.0 });

    let n = w.nrows();
    let mut s = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            s[[i, j]] = d_inv_sqrt[i] * w[[i, j]] * d_inv_sqrt[j];
        }
    }
    (s, sqrt_d)
}

/// Normalised Laplacian L_sym = I − D^{-1/2} W D^{-1/2}; isolated vertices
/// get zero rows/cols. Returns (L_sym, √d).
pub fn normalized_laplacian(w: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let (s, sqrt_d) = normalized_adjacency(w);
    let mut l = -s;
    for i in 0..l.nrows() {
        if sqrt_d[i] > 0.0 {
            l[[i, i]] += 1.0;
        }
    }
    (l, sqrt_d)
}

/// Combinatorial Laplacian L = D − W.
pub fn laplacian(w: ArrayView2<f64>) -> Array2<f64> {
    let d = degrees(w);
    let mut l = -w.to_owned();
    for i in 0..l.nrows() {
        l[[i, i]] += d[i];
    }
    l
}
