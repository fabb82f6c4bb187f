// ─────────────────────────────────────────────────────────────────────
// Gradspace — Eigensolvers
// ─────────────────────────────────────────────────────────────────────
//! Eigensolvers for the embedding and Moran pipelines.
//!
//! - `symmetric_eigen`: all pairs of a dense symmetric matrix
//!   (nalgebra's tridiagonal QR).
//! - `top_eigenpairs`: seeded block subspace iteration with Rayleigh–Ritz,
//!   for the few algebraically largest pairs of a large PSD operator.
//! - `thin_svd`: nalgebra's bidiagonal SVD, singular values descending.

use nalgebra as na;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use gradspace_types::{GradientError, GradientResult};

/// Eigenpairs with eigenvectors stored as columns.
#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    pub values: Array1<f64>,
    pub vectors: Array2<f64>,
}

impl EigenDecomposition {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reverse the pair order (ascending ↔ descending).
    ///
    /// The result is in standard layout.
    pub fn reversed(self) -> Self {
        let order: Vec<usize> = (0..self.len()).rev().collect();
        Self {
            values: self.values.select(Axis(0), &order),
            vectors: self.vectors.select(Axis(1), &order),
        }
    }
}

fn to_dmatrix(a: ArrayView2<f64>) -> na::DMatrix<f64> {
    let (n, m) = a.dim();
    na::DMatrix::from_fn(n, m, |i, j| a[[i, j]])
}

fn from_dmatrix(m: &na::DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

/// Full eigendecomposition of a dense symmetric matrix.
///
/// Eigenvalues ascending. Only the lower triangle is read, so callers
/// symmetrise beforehand when the input may not be symmetric.
/// `iter_per_value` caps the QR iterations at that many per eigenvalue.
pub fn symmetric_eigen(
    a: ArrayView2<f64>,
    iter_per_value: usize,
) -> GradientResult<EigenDecomposition> {
    let (n, m) = a.dim();
    if n != m {
        return Err(GradientError::InvalidInput(format!(
            "eigendecomposition needs a square matrix, got {n}x{m}"
        )));
    }
    if n == 0 {
        return Ok(EigenDecomposition {
            values: Array1::zeros(0),
            vectors: Array2::zeros((0, 0)),
        });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(GradientError::InvalidInput(
            "eigendecomposition input contains non-finite values".to_string(),
        ));
    }

    let budget = iter_per_value.max(1) * n;
    let eig = na::SymmetricEigen::try_new(to_dmatrix(a), f64::EPSILON, budget).ok_or(
        GradientError::Convergence {
            solver: "symmetric qr",
            iterations: budget,
            residual: f64::NAN,
        },
    )?;
    log::debug!("symmetric eigendecomposition done (n={n})");

    let values = Array1::from_iter(eig.eigenvalues.iter().copied());
    let vectors = from_dmatrix(&eig.eigenvectors);
    Ok(sort_ascending(values, vectors))
}

/// Sort eigenvalues ascending, rearranging eigenvector columns accordingly.
fn sort_ascending(values: Array1<f64>, vectors: Array2<f64>) -> EigenDecomposition {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    EigenDecomposition {
        values: values.select(Axis(0), &order),
        vectors: vectors.select(Axis(1), &order),
    }
}

/// Flip columns so the largest-magnitude entry of each is positive.
///
/// A deterministic convention only; eigenvector sign carries no meaning.
pub fn sign_by_max_abs(vectors: &mut Array2<f64>) {
    for mut col in vectors.axis_iter_mut(Axis(1)) {
        let mut max_abs = 0.0;
        let mut max_val = 0.0;
        for &v in col.iter() {
            if v.abs() > max_abs {
                max_abs = v.abs();
                max_val = v;
            }
        }
        if max_val < 0.0 {
            col.mapv_inplace(|v| -v);
        }
    }
}

// ── Subspace iteration ───────────────────────────────────────────────

/// Budget and accuracy for `top_eigenpairs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubspaceOptions {
    pub max_iter: usize,
    pub tol: f64,
    pub oversample: usize,
    /// QR iteration budget per eigenvalue for the Rayleigh–Ritz problems.
    pub iter_per_value: usize,
}

impl Default for SubspaceOptions {
    fn default() -> Self {
        Self {
            max_iter: 3000,
            tol: 1e-8,
            oversample: 10,
            iter_per_value: 30,
        }
    }
}

/// The `k` algebraically largest eigenpairs of a symmetric PSD operator.
///
/// `apply` maps an n×b block X to M·X. The start block is drawn from `rng`,
/// so a seeded generator makes the result reproducible. Eigenvalues are
/// returned in descending order.
pub fn top_eigenpairs<F, R>(
    n: usize,
    k: usize,
    apply: F,
    opts: &SubspaceOptions,
    rng: &mut R,
) -> GradientResult<EigenDecomposition>
where
    F: Fn(ArrayView2<f64>) -> Array2<f64>,
    R: Rng + ?Sized,
{
    if k == 0 || k > n {
        return Err(GradientError::InvalidInput(format!(
            "cannot extract {k} eigenpairs from an operator of size {n}"
        )));
    }
    let b = (k + opts.oversample).min(n);

    let mut q = Array2::from_shape_fn((n, b), |_| rng.sample::<f64, _>(StandardNormal));
    orthonormalize_columns(&mut q, rng);

    let mut worst = f64::INFINITY;
    for iter in 1..=opts.max_iter {
        let z = apply(q.view());

        let mut h = q.t().dot(&z);
        let ht = h.t().to_owned();
        h = (&h + &ht) * 0.5;
        let ritz = symmetric_eigen(h.view(), opts.iter_per_value)?.reversed();

        let q_rot = q.dot(&ritz.vectors);
        let z_rot = z.dot(&ritz.vectors);

        let scale = ritz.values[0].abs().max(1.0);
        worst = 0.0;
        for i in 0..k {
            let theta = ritz.values[i];
            let r = (&z_rot.column(i) - &(&q_rot.column(i) * theta))
                .iter()
                .map(|v| v * v)
                .sum::<f64>()
                .sqrt();
            worst = worst.max(r / scale);
        }

        if worst <= opts.tol {
            log::debug!("subspace iteration converged in {iter} iterations (n={n}, k={k})");
            return Ok(EigenDecomposition {
                values: ritz.values.slice(s![..k]).to_owned(),
                vectors: q_rot.slice(s![.., ..k]).to_owned(),
            });
        }

        q = z_rot;
        orthonormalize_columns(&mut q, rng);
    }

    Err(GradientError::Convergence {
        solver: "subspace iteration",
        iterations: opts.max_iter,
        residual: worst,
    })
}

/// Modified Gram–Schmidt in place.
///
/// Columns that collapse numerically are replaced by fresh Gaussian
/// directions so the block keeps full rank.
fn orthonormalize_columns<R: Rng + ?Sized>(q: &mut Array2<f64>, rng: &mut R) {
    let (n, b) = q.dim();
    for j in 0..b {
        for attempt in 0..3 {
            let before = q.column(j).dot(&q.column(j)).sqrt();
            for i in 0..j {
                let proj = q.column(i).dot(&q.column(j));
                let qi = q.column(i).to_owned();
                q.column_mut(j).scaled_add(-proj, &qi);
            }
            let norm = q.column(j).dot(&q.column(j)).sqrt();
            if norm > 1e-10 * before.max(f64::MIN_POSITIVE) && norm > 1e-300 {
                q.column_mut(j).mapv_inplace(|v| v / norm);
                break;
            }
            if attempt == 2 {
                log::warn!("subspace block column {j} stayed degenerate after reseeding");
            }
            for i in 0..n {
                q[[i, j]] = rng.sample(StandardNormal);
            }
        }
    }
}

// ── SVD ──────────────────────────────────────────────────────────────

/// Thin singular value decomposition A = U·diag(s)·Vᵀ.
///
/// For an m×n input U is m×r and V is n×r with r = min(m, n). Both have
/// orthonormal columns, including those belonging to zero singular values.
#[derive(Debug, Clone)]
pub struct Svd {
    pub u: Array2<f64>,
    /// Singular values, descending.
    pub s: Array1<f64>,
    pub v: Array2<f64>,
}

/// Thin SVD of an m×n matrix.
///
/// `iter_per_value` caps the implicit-shift iterations at that many per
/// singular value.
pub fn thin_svd(a: ArrayView2<f64>, iter_per_value: usize) -> GradientResult<Svd> {
    let (m, n) = a.dim();
    let r = m.min(n);
    if r == 0 {
        return Ok(Svd {
            u: Array2::zeros((m, 0)),
            s: Array1::zeros(0),
            v: Array2::zeros((n, 0)),
        });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(GradientError::InvalidInput(
            "svd input contains non-finite values".to_string(),
        ));
    }

    let budget = iter_per_value.max(1) * r;
    let svd = na::SVD::try_new(to_dmatrix(a), true, true, f64::EPSILON, budget).ok_or(
        GradientError::Convergence {
            solver: "bidiagonal svd",
            iterations: budget,
            residual: f64::NAN,
        },
    )?;
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(GradientError::InvalidInput(
                "svd did not produce singular vectors".to_string(),
            ))
        }
    };

    Ok(Svd {
        u: from_dmatrix(&u),
        s: Array1::from_iter(svd.singular_values.iter().copied()),
        v: Array2::from_shape_fn((n, r), |(i, j)| v_t[(j, i)]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sym4() -> Array2<f64> {
        array![
            [4.0, 1.0, 0.5, 0.2],
            [1.0, 3.0, 0.8, 0.3],
            [0.5, 0.8, 2.0, 0.1],
            [0.2, 0.3, 0.1, 1.0]
        ]
    }

    #[test]
    fn test_diagonal_eigenvalues() {
        let a = Array2::from_diag(&array![3.0, 1.0, 4.0, 2.0]);
        let eig = symmetric_eigen(a.view(), 30).unwrap();
        for (i, &v) in eig.values.iter().enumerate() {
            assert_abs_diff_eq!(v, (i + 1) as f64, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_symmetric_matrix_eigenvectors_orthogonal() {
        let eig = symmetric_eigen(sym4().view(), 30).unwrap();
        let vtv = eig.vectors.t().dot(&eig.vectors);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (vtv[[i, j]] - expected).abs() < 1e-10,
                    "V^T V[{i},{j}] = {}, expected {expected}",
                    vtv[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_eigen_reconstructs_matrix() {
        let a = sym4();
        let eig = symmetric_eigen(a.view(), 30).unwrap();
        for i in 0..4 {
            let av = a.dot(&eig.vectors.column(i));
            let lv = &eig.vectors.column(i) * eig.values[i];
            for r in 0..4 {
                assert_abs_diff_eq!(av[r], lv[r], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_eigenvalues_ascending() {
        let eig = symmetric_eigen(sym4().view(), 30).unwrap();
        for i in 1..4 {
            assert!(eig.values[i] >= eig.values[i - 1]);
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut a = sym4();
        a[[1, 2]] = f64::NAN;
        assert!(matches!(
            symmetric_eigen(a.view(), 30),
            Err(GradientError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reversed_is_standard_layout() {
        let eig = symmetric_eigen(sym4().view(), 30).unwrap();
        let ascending = eig.values.to_vec();
        let rev = eig.reversed();
        assert!(rev.values.is_standard_layout());
        assert!(rev.vectors.is_standard_layout());
        let values = rev.values.as_slice().unwrap();
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(v, ascending[3 - i]);
        }
        for w in values.windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn test_large_ring_laplacian() {
        // Cycle Laplacian eigenvalues are 2 - 2cos(2πk/n).
        let n = 120;
        let mut l = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            let j = (i + 1) % n;
            l[[i, i]] += 1.0;
            l[[j, j]] += 1.0;
            l[[i, j]] -= 1.0;
            l[[j, i]] -= 1.0;
        }
        let eig = symmetric_eigen(l.view(), 30).unwrap();
        assert_abs_diff_eq!(eig.values[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(eig.values[n - 1], 4.0, epsilon = 1e-9);
        let step = 2.0 - 2.0 * (2.0 * std::f64::consts::PI / n as f64).cos();
        assert_abs_diff_eq!(eig.values[1], step, epsilon = 1e-9);
        assert_abs_diff_eq!(eig.values[2], step, epsilon = 1e-9);
    }

    #[test]
    fn test_non_square_rejected() {
        let a = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            symmetric_eigen(a.view(), 10),
            Err(GradientError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sign_by_max_abs() {
        let mut v = array![[0.1, -0.2], [-0.9, 0.3], [0.2, -0.8]];
        sign_by_max_abs(&mut v);
        assert!(v[[1, 0]] > 0.0);
        assert!(v[[2, 1]] > 0.0);
        assert_abs_diff_eq!(v[[0, 0]], -0.1);
    }

    #[test]
    fn test_subspace_matches_dense() {
        // PSD matrix with a clear spectrum: B^T B + diag.
        let n = 30;
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let b = Array2::from_shape_fn((n, n), |_| rng.gen::<f64>() - 0.5);
        let mut m = b.t().dot(&b);
        for i in 0..n {
            m[[i, i]] += (n - i) as f64;
        }
        let dense = symmetric_eigen(m.view(), 30).unwrap().reversed();

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let sub = top_eigenpairs(
            n,
            3,
            |x| m.dot(&x),
            &SubspaceOptions::default(),
            &mut rng,
        )
        .unwrap();
        for i in 0..3 {
            assert!(
                (sub.values[i] - dense.values[i]).abs() < 1e-6 * dense.values[0],
                "eigenvalue {i}: {} vs {}",
                sub.values[i],
                dense.values[i]
            );
            let dot = sub.vectors.column(i).dot(&dense.vectors.column(i)).abs();
            assert!((dot - 1.0).abs() < 1e-6, "eigenvector {i} overlap {dot}");
        }
    }

    #[test]
    fn test_subspace_seed_reproducible() {
        let m = sym4();
        let opts = SubspaceOptions {
            oversample: 1,
            ..Default::default()
        };
        let a = top_eigenpairs(4, 2, |x| m.dot(&x), &opts, &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        let b = top_eigenpairs(4, 2, |x| m.dot(&x), &opts, &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        assert_eq!(a.values, b.values);
        assert_eq!(a.vectors, b.vectors);
    }

    #[test]
    fn test_subspace_budget_exhausted() {
        let n = 40;
        // Nearly flat spectrum: convergence needs far more than 2 iterations.
        let m = Array2::from_diag(&Array1::from_shape_fn(n, |i| 1.0 + 1e-3 * i as f64));
        let opts = SubspaceOptions {
            max_iter: 2,
            oversample: 0,
            ..Default::default()
        };
        let err = top_eigenpairs(n, 2, |x| m.dot(&x), &opts, &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap_err();
        assert!(matches!(err, GradientError::Convergence { iterations: 2, .. }));
    }

    #[test]
    fn test_svd_reconstructs() {
        let a = array![[3.0, 1.0, 0.0], [1.0, -2.0, 4.0], [0.5, 0.0, 1.0], [2.0, 2.0, 2.0]];
        let svd = thin_svd(a.view(), 30).unwrap();
        let rec = svd.u.dot(&Array2::from_diag(&svd.s)).dot(&svd.v.t());
        for (x, y) in rec.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
        for i in 1..svd.s.len() {
            assert!(svd.s[i] <= svd.s[i - 1]);
        }
    }

    #[test]
    fn test_svd_wide_matrix() {
        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let svd = thin_svd(a.view(), 30).unwrap();
        assert_eq!(svd.u.dim(), (2, 2));
        assert_eq!(svd.v.dim(), (3, 2));
        assert!(svd.v.is_standard_layout());
        let rec = svd.u.dot(&Array2::from_diag(&svd.s)).dot(&svd.v.t());
        for (x, y) in rec.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_svd_rank_deficient_vectors_orthonormal() {
        // Rank one: the second singular value is zero.
        let a = array![[2.0, 3.0], [4.0, 6.0]];
        let svd = thin_svd(a.view(), 30).unwrap();
        assert_abs_diff_eq!(svd.s[1], 0.0, epsilon = 1e-12);
        let utu = svd.u.t().dot(&svd.u);
        let vtv = svd.v.t().dot(&svd.v);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(utu[[i, j]], expected, epsilon = 1e-12);
                assert_abs_diff_eq!(vtv[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_svd_empty() {
        let a = Array2::<f64>::zeros((3, 0));
        let svd = thin_svd(a.view(), 30).unwrap();
        assert_eq!(svd.u.dim(), (3, 0));
        assert!(svd.s.is_empty());
    }
}
