// ─────────────────────────────────────────────────────────────────────
// Gradspace — Moran Spectral Randomization
// ─────────────────────────────────────────────────────────────────────
//! Moran spectral randomization null model.
//!
//! Fit: the doubly-centred spatial weight matrix is eigendecomposed; its
//! eigenvectors (Moran eigenvector maps) form an orthonormal basis of
//! mean-zero patterns ordered by spatial autocorrelation, with
//! Moran's I = (n / S₀) · λ.
//!
//! Randomize: the centred data are expressed in that basis through the
//! correlations r_j = corr(x, v_j). Each surrogate perturbs the r_j
//! (sign flips or pairwise rotations), keeping every |r_j| or pair norm,
//! then rebuilds mean + ‖x − mean‖ · Σ r'_j v_j. Surrogates keep the
//! mean, the variance and the autocorrelation spectrum of the input.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;
use sprs::CsMat;

use gradspace_spectral::symmetric_eigen;
use gradspace_types::{
    check_mask, mask_indices, GradientError, GradientResult, MoranConfig, MoranProcedure,
    MoranSpectrum, SeedStream, SurfaceGeometry,
};

/// Relative tolerance of the weight-matrix symmetry check.
const SYMMETRY_TOL: f64 = 1e-10;
/// Residual norm below which a vector counts as collapsed in Gram–Schmidt.
const COLLAPSE_TOL: f64 = 1e-8;

/// Eigenvectors with a given sign of Moran's I.
#[derive(Debug, Clone, PartialEq)]
pub struct MoranComponents {
    pub vectors: Array2<f64>,
    pub moran_i: Array1<f64>,
}

/// Immutable result of `MoranRandomization::fit`.
#[derive(Debug, Clone, PartialEq)]
pub struct MoranEigenvectors {
    /// n_included × m, orthonormal, mean-zero columns.
    pub vectors: Array2<f64>,
    /// Eigenvalues of the centred weight matrix, descending.
    pub eigenvalues: Array1<f64>,
    pub moran_i: Array1<f64>,
    pub seed: u64,
    procedure: MoranProcedure,
    n_total: usize,
    included: Option<Vec<usize>>,
}

impl MoranEigenvectors {
    pub fn len(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eigenvalues.is_empty()
    }

    /// Number of vertices data vectors must have.
    pub fn n_vertices(&self) -> usize {
        self.n_total
    }

    /// Eigenvectors with positive Moran's I (positive autocorrelation).
    pub fn positive(&self) -> MoranComponents {
        self.select(|mi| mi > 0.0)
    }

    /// Eigenvectors with negative Moran's I.
    pub fn negative(&self) -> MoranComponents {
        self.select(|mi| mi < 0.0)
    }

    fn select(&self, keep: impl Fn(f64) -> bool) -> MoranComponents {
        let idx: Vec<usize> = (0..self.len()).filter(|&j| keep(self.moran_i[j])).collect();
        MoranComponents {
            vectors: self.vectors.select(Axis(1), &idx),
            moran_i: self.moran_i.select(Axis(0), &idx),
        }
    }

    /// `n_rep` surrogates of `data`, one per row.
    ///
    /// Vertices excluded at fit time are NaN in every surrogate; included
    /// vertices must be finite.
    pub fn randomize(&self, data: &[f64], n_rep: usize) -> GradientResult<Array2<f64>> {
        if data.len() != self.n_total {
            return Err(GradientError::shape("moran data", self.n_total, data.len()));
        }
        if n_rep == 0 {
            return Err(GradientError::InvalidInput("n_rep must be >= 1".to_string()));
        }
        let x: Array1<f64> = match &self.included {
            Some(idx) => idx.iter().map(|&i| data[i]).collect(),
            None => Array1::from(data.to_vec()),
        };
        if let Some(pos) = x.iter().position(|v| !v.is_finite()) {
            let vertex = self.included.as_ref().map_or(pos, |idx| idx[pos]);
            return Err(GradientError::InvalidInput(format!(
                "non-finite value at included vertex {vertex}"
            )));
        }

        let mean = x.mean().unwrap_or(0.0);
        let centred = x.mapv(|v| v - mean);
        let norm = centred.dot(&centred).sqrt();

        let rows: Vec<Array1<f64>> = if norm <= f64::EPSILON * mean.abs().max(1.0) {
            log::warn!("constant input to moran randomization; surrogates equal the input");
            vec![x.clone(); n_rep]
        } else {
            let r = self.vectors.t().dot(&centred) / norm;
            let seeds = SeedStream::new(self.seed);
            (0..n_rep as u64)
                .into_par_iter()
                .map(|rep| {
                    let mut rng = seeds.fork(rep);
                    let perturbed = perturb(r.view(), self.procedure, &mut rng);
                    self.vectors.dot(&perturbed) * norm + mean
                })
                .collect()
        };

        let mut out = Array2::from_elem((n_rep, self.n_total), f64::NAN);
        for (mut dst, row) in out.rows_mut().into_iter().zip(rows) {
            match &self.included {
                Some(idx) => {
                    for (&i, &v) in idx.iter().zip(row.iter()) {
                        dst[i] = v;
                    }
                }
                None => dst.assign(&row),
            }
        }
        Ok(out)
    }
}

fn perturb<R: Rng + ?Sized>(
    r: ArrayView1<f64>,
    procedure: MoranProcedure,
    rng: &mut R,
) -> Array1<f64> {
    let mut out = r.to_owned();
    match procedure {
        MoranProcedure::Singleton => {
            for v in out.iter_mut() {
                if rng.gen::<bool>() {
                    *v = -*v;
                }
            }
        }
        MoranProcedure::Pair => {
            let m = out.len();
            for i in (0..m.saturating_sub(1)).step_by(2) {
                let rho = out[i].hypot(out[i + 1]);
                let theta = rng.gen_range(0.0..std::f64::consts::TAU);
                out[i] = rho * theta.cos();
                out[i + 1] = rho * theta.sin();
            }
            if m % 2 == 1 && rng.gen::<bool>() {
                out[m - 1] = -out[m - 1];
            }
        }
    }
    out
}

/// Moran spectral randomization estimator.
#[derive(Debug, Clone)]
pub struct MoranRandomization {
    config: MoranConfig,
    fitted: Option<MoranEigenvectors>,
}

impl MoranRandomization {
    pub fn new(config: MoranConfig) -> GradientResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            fitted: None,
        })
    }

    pub fn config(&self) -> &MoranConfig {
        &self.config
    }

    pub fn fitted(&self) -> Option<&MoranEigenvectors> {
        self.fitted.as_ref()
    }

    /// Fit on a sparse spatial weight matrix.
    pub fn fit(&mut self, weights: &CsMat<f64>) -> GradientResult<&MoranEigenvectors> {
        self.fit_dense(weights.to_dense().view(), None)
    }

    /// Fit on the vertices where `mask` is true.
    pub fn fit_masked(
        &mut self,
        weights: &CsMat<f64>,
        mask: &[bool],
    ) -> GradientResult<&MoranEigenvectors> {
        self.fit_dense(weights.to_dense().view(), Some(mask))
    }

    /// Fit on a dense spatial weight matrix, optionally masked.
    pub fn fit_dense(
        &mut self,
        weights: ArrayView2<f64>,
        mask: Option<&[bool]>,
    ) -> GradientResult<&MoranEigenvectors> {
        let n = weights.nrows();
        let (reduced, included) = match mask {
            Some(mask) => {
                check_mask(mask, n, "moran mask")?;
                let idx = mask_indices(mask);
                (weights.select(Axis(0), &idx).select(Axis(1), &idx), Some(idx))
            }
            None => (weights.to_owned(), None),
        };
        let fitted = self.decompose(reduced.view(), n, included)?;
        Ok(self.fitted.insert(fitted))
    }

    /// Fit on proximity weights 1/d derived from ring distances on a surface.
    pub fn fit_surface(
        &mut self,
        surface: &dyn SurfaceGeometry,
        n_ring: usize,
        mask: Option<&[bool]>,
    ) -> GradientResult<&MoranEigenvectors> {
        let n = surface.n_points();
        if let Some(mask) = mask {
            check_mask(mask, n, "moran mask")?;
        }
        let distances = surface.ring_distance(n_ring, mask)?;
        let mut weights = distances.to_dense();
        for ((i, j), w) in weights.indexed_iter_mut() {
            *w = if i != j && *w > 0.0 { 1.0 / *w } else { 0.0 };
        }
        let included = mask.map(mask_indices);
        let fitted = self.decompose(weights.view(), n, included)?;
        Ok(self.fitted.insert(fitted))
    }

    /// Surrogates using the configured `n_rep`.
    pub fn randomize(&self, data: &[f64]) -> GradientResult<Array2<f64>> {
        self.randomize_with(data, self.config.n_rep)
    }

    pub fn randomize_with(&self, data: &[f64], n_rep: usize) -> GradientResult<Array2<f64>> {
        self.fitted
            .as_ref()
            .ok_or_else(|| GradientError::InvalidInput("randomize called before fit".to_string()))?
            .randomize(data, n_rep)
    }

    fn decompose(
        &self,
        w: ArrayView2<f64>,
        n_total: usize,
        included: Option<Vec<usize>>,
    ) -> GradientResult<MoranEigenvectors> {
        validate_weights(w)?;
        let n = w.nrows();
        let s0 = w.sum();

        let centred = double_centre(w);
        let eig = symmetric_eigen(centred.view(), self.config.iter_per_value)?.reversed();

        let (values, vectors) = match self.config.spectrum {
            MoranSpectrum::NonZero => {
                let keep: Vec<usize> = (0..eig.len())
                    .filter(|&j| eig.values[j].abs() >= self.config.tol)
                    .collect();
                (
                    eig.values.select(Axis(0), &keep),
                    eig.vectors.select(Axis(1), &keep),
                )
            }
            MoranSpectrum::All => drop_constant(&eig.values, &eig.vectors, self.config.tol),
        };

        let retained = values.len();
        if retained < 2 {
            return Err(GradientError::SingularWeightMatrix { retained });
        }
        let moran_i = values.mapv(|l| n as f64 / s0 * l);
        let seeds = SeedStream::from_option(self.config.random_seed);
        log::info!(
            "moran eigenvectors fitted: n={n}, retained={retained}, I in [{:.4}, {:.4}]",
            moran_i[retained - 1],
            moran_i[0]
        );
        Ok(MoranEigenvectors {
            vectors,
            eigenvalues: values,
            moran_i,
            seed: seeds.seed(),
            procedure: self.config.procedure,
            n_total,
            included,
        })
    }
}

fn validate_weights(w: ArrayView2<f64>) -> GradientResult<()> {
    let (n, c) = w.dim();
    if n != c {
        return Err(GradientError::InvalidInput(format!(
            "weight matrix must be square, got {n}x{c}"
        )));
    }
    let mut max_abs = 0.0_f64;
    for ((i, j), &v) in w.indexed_iter() {
        if !v.is_finite() || v < 0.0 {
            return Err(GradientError::InvalidInput(format!(
                "weights must be finite and non-negative, got {v} at ({i}, {j})"
            )));
        }
        if i == j && v != 0.0 {
            return Err(GradientError::InvalidInput(format!(
                "weight matrix diagonal must be zero, got {v} at vertex {i}"
            )));
        }
        max_abs = max_abs.max(v);
    }
    for i in 0..n {
        for j in (i + 1)..n {
            if (w[[i, j]] - w[[j, i]]).abs() > SYMMETRY_TOL * max_abs {
                return Err(GradientError::InvalidInput(format!(
                    "weight matrix is not symmetric at ({i}, {j})"
                )));
            }
        }
    }
    Ok(())
}

/// w − row mean − column mean + grand mean.
fn double_centre(w: ArrayView2<f64>) -> Array2<f64> {
    let n = w.nrows();
    let row = w.sum_axis(Axis(1)) / n as f64;
    let col = w.sum_axis(Axis(0)) / n as f64;
    let grand = row.sum() / n as f64;
    Array2::from_shape_fn((n, n), |(i, j)| w[[i, j]] - row[i] - col[j] + grand)
}

/// Every eigenvector except the constant one.
///
/// The near-zero block may mix the constant vector with genuine null-space
/// patterns, so it is projected off 1/√n and re-orthonormalised.
fn drop_constant(
    values: &Array1<f64>,
    vectors: &Array2<f64>,
    tol: f64,
) -> (Array1<f64>, Array2<f64>) {
    let (n, m) = vectors.dim();
    let zero: Vec<usize> = (0..m).filter(|&j| values[j].abs() < tol).collect();
    let wanted_zero = zero.len().saturating_sub(1);

    let constant = Array1::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut basis: Vec<Array1<f64>> = vec![constant];
    let mut candidates: Vec<Array1<f64>> =
        zero.iter().map(|&j| vectors.column(j).to_owned()).collect();
    candidates.sort_by(|a, b| {
        let pa = a.dot(&basis[0]).abs();
        let pb = b.dot(&basis[0]).abs();
        pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut null_vectors = Vec::with_capacity(wanted_zero);
    for mut v in candidates {
        if null_vectors.len() == wanted_zero {
            break;
        }
        for q in &basis {
            let proj = v.dot(q);
            v.scaled_add(-proj, q);
        }
        let norm = v.dot(&v).sqrt();
        if norm > COLLAPSE_TOL {
            v.mapv_inplace(|x| x / norm);
            basis.push(v.clone());
            null_vectors.push(v);
        }
    }

    let mut out_values = Vec::with_capacity(m);
    let mut out_columns: Vec<Array1<f64>> = Vec::with_capacity(m);
    for j in (0..m).filter(|&j| values[j] >= tol) {
        out_values.push(values[j]);
        out_columns.push(vectors.column(j).to_owned());
    }
    for v in null_vectors {
        out_values.push(0.0);
        out_columns.push(v);
    }
    for j in (0..m).filter(|&j| values[j] <= -tol) {
        out_values.push(values[j]);
        out_columns.push(vectors.column(j).to_owned());
    }

    let mut out = Array2::zeros((n, out_columns.len()));
    for (j, col) in out_columns.iter().enumerate() {
        out.column_mut(j).assign(col);
    }
    (Array1::from(out_values), out)
}
