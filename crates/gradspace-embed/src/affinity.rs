// ─────────────────────────────────────────────────────────────────────
// Gradspace — Affinity Builder
// ─────────────────────────────────────────────────────────────────────
//! Input matrix → non-negative affinity matrix.
//!
//! Rows of the input are feature vectors; the kernel compares every pair of
//! rows. Pipeline:
//!   1. Validate (square, finite; non-negative when precomputed)
//!   2. Optional per-row sparsification of the input (`pre_sparsify`)
//!   3. Kernel (skipped for precomputed input and `Kernel::None`)
//!   4. Clip negative affinities to zero
//!   5. Per-row sparsification of the affinity, then re-symmetrisation
//!
//! Guarantees: output shape equals input shape, every entry ≥ 0, and
//! sparsification never removes the largest entry of a row. Kernels give
//! every row a positive self-affinity, including constant and zero rows.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use sprs::CsMat;

use gradspace_types::{EmbeddingConfig, GradientError, GradientResult, Kernel, Sparsity, Symmetrize};

/// Builds affinity matrices with a fixed kernel and sparsity policy.
#[derive(Debug, Clone, PartialEq)]
pub struct AffinityBuilder {
    kernel: Kernel,
    sparsity: Sparsity,
    symmetrize: Symmetrize,
    pre_sparsify: bool,
    precomputed: bool,
}

impl AffinityBuilder {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            sparsity: Sparsity::KeepAll,
            symmetrize: Symmetrize::Average,
            pre_sparsify: false,
            precomputed: false,
        }
    }

    /// Input is already an affinity: the kernel step is bypassed and
    /// negative entries are rejected instead of clipped.
    pub fn precomputed() -> Self {
        Self {
            precomputed: true,
            ..Self::new(Kernel::None)
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            kernel: config.kernel,
            sparsity: config.sparsity,
            symmetrize: config.symmetrize,
            pre_sparsify: config.pre_sparsify,
            precomputed: false,
        }
    }

    pub fn with_sparsity(mut self, sparsity: Sparsity) -> Self {
        self.sparsity = sparsity;
        self
    }

    pub fn with_symmetrize(mut self, symmetrize: Symmetrize) -> Self {
        self.symmetrize = symmetrize;
        self
    }

    pub fn with_pre_sparsify(mut self, pre_sparsify: bool) -> Self {
        self.pre_sparsify = pre_sparsify;
        self
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    /// Build the affinity of a dense matrix.
    pub fn build(&self, m: ArrayView2<f64>) -> GradientResult<Array2<f64>> {
        validate_input(m)?;
        if self.precomputed {
            if let Some(((i, j), v)) = m.indexed_iter().find(|(_, &v)| v < 0.0) {
                return Err(GradientError::InvalidInput(format!(
                    "precomputed affinity has negative entry {v} at ({i}, {j})"
                )));
            }
        }

        let applies_kernel = !self.precomputed && self.kernel != Kernel::None;
        let input_sparsified = self.pre_sparsify && applies_kernel;

        let x = if input_sparsified {
            keep_top_per_row(m, self.sparsity.kept_per_row(m.ncols()))
        } else {
            m.to_owned()
        };

        let mut a = if applies_kernel {
            compute_kernel(x.view(), self.kernel)
        } else {
            x
        };
        a.mapv_inplace(|v| if v > 0.0 { v } else { 0.0 });

        if !input_sparsified && self.sparsity != Sparsity::KeepAll {
            let k = self.sparsity.kept_per_row(a.ncols());
            a = keep_top_per_row(a.view(), k);
            a = symmetrize(a, self.symmetrize);
        }
        log::debug!(
            "affinity built: n={}, kernel={}, nnz={}",
            a.nrows(),
            self.kernel,
            a.iter().filter(|&&v| v > 0.0).count()
        );
        Ok(a)
    }

    /// Build the affinity of a sparse matrix (densified first).
    pub fn build_sparse(&self, m: &CsMat<f64>) -> GradientResult<Array2<f64>> {
        self.build(m.to_dense().view())
    }
}

fn validate_input(m: ArrayView2<f64>) -> GradientResult<()> {
    let (n, c) = m.dim();
    if n != c {
        return Err(GradientError::InvalidInput(format!(
            "input matrix must be square, got {n}x{c}"
        )));
    }
    if n == 0 {
        return Err(GradientError::InvalidInput("input matrix is empty".to_string()));
    }
    if let Some(((i, j), v)) = m.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(GradientError::InvalidInput(format!(
            "non-finite value {v} at ({i}, {j})"
        )));
    }
    Ok(())
}

/// Apply a kernel between every pair of rows.
pub fn compute_kernel(x: ArrayView2<f64>, kernel: Kernel) -> Array2<f64> {
    match kernel {
        Kernel::Pearson => correlation(x),
        Kernel::Spearman => correlation(rank_rows(x).view()),
        Kernel::Cosine => cosine_similarity(x),
        Kernel::NormalizedAngle => cosine_similarity(x)
            .mapv(|c| 1.0 - c.clamp(-1.0, 1.0).acos() / std::f64::consts::PI),
        Kernel::Gaussian { gamma } => {
            let gamma = gamma.unwrap_or(1.0 / x.ncols().max(1) as f64);
            gaussian(x, gamma)
        }
        Kernel::None => x.to_owned(),
    }
}

/// Rows scaled to unit norm; zero rows stay zero and are returned.
fn unit_rows(mut x: Array2<f64>) -> (Array2<f64>, Vec<usize>) {
    let mut degenerate = Vec::new();
    for (i, mut row) in x.rows_mut().into_iter().enumerate() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        } else {
            degenerate.push(i);
        }
    }
    (x, degenerate)
}

/// Gram matrix of unit rows. Degenerate rows keep a unit self-affinity so
/// no row of the kernel is empty.
fn unit_gram(x: Array2<f64>, what: &str) -> Array2<f64> {
    let (xn, degenerate) = unit_rows(x);
    let mut a = xn.dot(&xn.t());
    if !degenerate.is_empty() {
        log::warn!(
            "{} rows with zero {what}; only their self-affinity is kept",
            degenerate.len()
        );
        for i in degenerate {
            a[[i, i]] = 1.0;
        }
    }
    a
}

fn cosine_similarity(x: ArrayView2<f64>) -> Array2<f64> {
    unit_gram(x.to_owned(), "norm")
}

fn correlation(x: ArrayView2<f64>) -> Array2<f64> {
    let mean = x.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(x.nrows()));
    let centred = &x - &mean.insert_axis(Axis(1));
    unit_gram(centred, "variance")
}

fn gaussian(x: ArrayView2<f64>, gamma: f64) -> Array2<f64> {
    let n = x.nrows();
    let sq: Vec<f64> = x.rows().into_iter().map(|r| r.dot(&r)).collect();
    let g = x.dot(&x.t());
    let mut a = Array2::zeros((n, n));
    for i in 0..n {
        a[[i, i]] = 1.0;
        for j in (i + 1)..n {
            let d2 = (sq[i] + sq[j] - 2.0 * g[[i, j]]).max(0.0);
            let w = (-gamma * d2).exp();
            a[[i, j]] = w;
            a[[j, i]] = w;
        }
    }
    a
}

/// Replace each row by its ranks (1-based, ties get the average rank).
fn rank_rows(x: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(x.dim());
    for (row, mut dst) in x.rows().into_iter().zip(out.rows_mut()) {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| {
            row[a]
                .partial_cmp(&row[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut i = 0;
        while i < order.len() {
            let mut j = i;
            while j + 1 < order.len() && row[order[j + 1]] == row[order[i]] {
                j += 1;
            }
            let rank = (i + j) as f64 / 2.0 + 1.0;
            for &idx in &order[i..=j] {
                dst[idx] = rank;
            }
            i = j + 1;
        }
    }
    out
}

/// Keep the `k` largest entries of each row (ties resolved by column order).
fn keep_top_per_row(m: ArrayView2<f64>, k: usize) -> Array2<f64> {
    let mut out = Array2::zeros(m.dim());
    for (row, mut dst) in m.rows().into_iter().zip(out.rows_mut()) {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| {
            row[b]
                .partial_cmp(&row[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for &j in order.iter().take(k) {
            dst[j] = row[j];
        }
    }
    out
}

fn symmetrize(a: Array2<f64>, policy: Symmetrize) -> Array2<f64> {
    match policy {
        Symmetrize::Average => (&a + &a.t()) * 0.5,
        Symmetrize::Maximum => {
            let t = a.t().to_owned();
            ndarray::Zip::from(&a).and(&t).map_collect(|&x, &y| x.max(y))
        }
        Symmetrize::None => a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_square(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((n, n), |_| rng.gen::<f64>() * 2.0 - 1.0)
    }

    const ALL_KERNELS: [Kernel; 6] = [
        Kernel::Pearson,
        Kernel::Spearman,
        Kernel::Cosine,
        Kernel::NormalizedAngle,
        Kernel::Gaussian { gamma: None },
        Kernel::None,
    ];

    #[test]
    fn test_shape_and_non_negative_for_every_kernel() {
        let m = random_square(20, 1);
        for kernel in ALL_KERNELS {
            let a = AffinityBuilder::new(kernel).build(m.view()).unwrap();
            assert_eq!(a.dim(), (20, 20), "kernel {kernel}");
            assert!(a.iter().all(|&v| v >= 0.0), "negative entry for kernel {kernel}");
        }
    }

    #[test]
    fn test_sparsity_keeps_a_nonzero_per_row() {
        let m = random_square(30, 2);
        for kernel in ALL_KERNELS {
            for sparsity in [Sparsity::Fraction(0.9), Sparsity::Neighbors(1), Sparsity::Neighbors(4)] {
                let a = AffinityBuilder::new(kernel)
                    .with_sparsity(sparsity)
                    .build(m.view())
                    .unwrap();
                for (i, row) in a.rows().into_iter().enumerate() {
                    assert!(
                        row.iter().any(|&v| v > 0.0),
                        "row {i} empty for kernel {kernel} / {sparsity:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_constant_row_keeps_self_affinity() {
        let mut m = random_square(12, 5);
        m.row_mut(4).fill(0.7);
        m.row_mut(7).fill(0.0);
        for kernel in [Kernel::Pearson, Kernel::Spearman, Kernel::Cosine, Kernel::NormalizedAngle] {
            let a = AffinityBuilder::new(kernel)
                .with_sparsity(Sparsity::Neighbors(1))
                .build(m.view())
                .unwrap();
            for (i, row) in a.rows().into_iter().enumerate() {
                assert!(
                    row.iter().any(|&v| v > 0.0),
                    "row {i} empty for kernel {kernel}"
                );
            }
            if kernel != Kernel::NormalizedAngle {
                assert_abs_diff_eq!(a[[4, 4]], 1.0, epsilon = 1e-12);
            }
            assert_abs_diff_eq!(a[[7, 7]], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sparsified_affinity_is_symmetric() {
        let m = random_square(15, 3);
        let a = AffinityBuilder::new(Kernel::Cosine)
            .with_sparsity(Sparsity::Neighbors(3))
            .build(m.view())
            .unwrap();
        for i in 0..15 {
            for j in 0..15 {
                assert_abs_diff_eq!(a[[i, j]], a[[j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_maximum_symmetrize() {
        let m = array![[1.0, 0.9, 0.1], [0.2, 1.0, 0.3], [0.8, 0.05, 1.0]];
        let a = AffinityBuilder::precomputed()
            .with_sparsity(Sparsity::Neighbors(2))
            .with_symmetrize(Symmetrize::Maximum)
            .build(m.view())
            .unwrap();
        // Row 1 keeps (1,1) and (1,2); (0,1) survives in row 0 and wins the max.
        assert_abs_diff_eq!(a[[0, 1]], 0.9);
        assert_abs_diff_eq!(a[[1, 0]], 0.9);
        assert_abs_diff_eq!(a[[0, 2]], 0.8);
    }

    #[test]
    fn test_normalized_angle_values() {
        let m = array![[1.0, 0.0], [0.0, 1.0]];
        let a = compute_kernel(m.view(), Kernel::NormalizedAngle);
        assert_abs_diff_eq!(a[[0, 0]], 1.0, epsilon = 1e-7);
        assert_abs_diff_eq!(a[[0, 1]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_pearson_diagonal_is_one() {
        let a = compute_kernel(random_square(10, 4).view(), Kernel::Pearson);
        for i in 0..10 {
            assert_abs_diff_eq!(a[[i, i]], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_spearman_ranks_with_ties() {
        let r = rank_rows(array![[3.0, 1.0, 3.0, 2.0]].view());
        assert_eq!(r, array![[3.5, 1.0, 3.5, 2.0]]);
    }

    #[test]
    fn test_spearman_monotone_invariance() {
        let m = random_square(8, 5);
        let cubed = m.mapv(|v| v * v * v);
        let a = compute_kernel(m.view(), Kernel::Spearman);
        let b = compute_kernel(cubed.view(), Kernel::Spearman);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gaussian_gamma() {
        let m = array![[0.0, 0.0], [1.0, 1.0]];
        let a = compute_kernel(m.view(), Kernel::Gaussian { gamma: Some(0.5) });
        assert_abs_diff_eq!(a[[0, 1]], (-1.0_f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(a[[1, 1]], 1.0);
    }

    #[test]
    fn test_non_square_rejected() {
        let m = Array2::<f64>::zeros((3, 4));
        let err = AffinityBuilder::new(Kernel::Cosine).build(m.view()).unwrap_err();
        assert!(matches!(err, GradientError::InvalidInput(_)));
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut m = random_square(4, 6);
        m[[2, 1]] = f64::NAN;
        let err = AffinityBuilder::new(Kernel::Pearson).build(m.view()).unwrap_err();
        assert!(err.to_string().contains("(2, 1)"), "{err}");
    }

    #[test]
    fn test_precomputed_rejects_negative() {
        let m = array![[1.0, -0.1], [0.2, 1.0]];
        assert!(AffinityBuilder::precomputed().build(m.view()).is_err());
    }

    #[test]
    fn test_precomputed_passes_through() {
        let m = array![[0.0, 0.4], [0.4, 0.0]];
        let a = AffinityBuilder::precomputed().build(m.view()).unwrap();
        assert_eq!(a, m);
    }

    #[test]
    fn test_pre_sparsify_keeps_kernel_symmetric() {
        let m = random_square(12, 7);
        let a = AffinityBuilder::new(Kernel::NormalizedAngle)
            .with_sparsity(Sparsity::Fraction(0.75))
            .with_pre_sparsify(true)
            .build(m.view())
            .unwrap();
        for i in 0..12 {
            for j in 0..12 {
                assert_abs_diff_eq!(a[[i, j]], a[[j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_sparse_input_matches_dense() {
        let mut tri = sprs::TriMat::new((3, 3));
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(1, 0, 1.0);
        tri.add_triplet(1, 2, 2.0);
        tri.add_triplet(2, 1, 2.0);
        let sparse: CsMat<f64> = tri.to_csr();
        let builder = AffinityBuilder::new(Kernel::Cosine);
        let a = builder.build_sparse(&sparse).unwrap();
        let b = builder.build(sparse.to_dense().view()).unwrap();
        assert_eq!(a, b);
    }
}
