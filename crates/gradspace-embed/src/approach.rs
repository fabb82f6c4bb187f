// ─────────────────────────────────────────────────────────────────────
// Gradspace — Embedding Approaches
// ─────────────────────────────────────────────────────────────────────
//! Affinity matrix → low-dimensional embedding.
//!
//! Three decompositions, selected by `Approach`:
//!
//! - **Linear**: SVD of the column-centred affinity. Components are U·S,
//!   importances the singular values (descending).
//! - **Laplacian eigenmap**: k + 1 smallest eigenpairs of the (normalised)
//!   graph Laplacian, trivial pair dropped. Importances ascending.
//! - **Diffusion map**: k + 1 largest eigenpairs of D^-½ W D^-½ after the
//!   optional anisotropic step, right eigenvectors ψ = v / v₀, trivial pair
//!   dropped, components ψ scaled by the importances (descending).
//!
//! Column signs are fixed so that the largest-magnitude entry of every
//! component is positive.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use gradspace_spectral::{
    degrees, is_connected, is_symmetric, laplacian, normalized_adjacency, normalized_laplacian,
    sign_by_max_abs, symmetric_eigen, symmetrize_average, thin_svd, top_eigenpairs,
    EigenDecomposition, SubspaceOptions, DEGREE_FLOOR,
};
use gradspace_types::{streams, Approach, GradientError, GradientResult, SeedStream, Solver};

/// Lower bound on |ψ₀| when normalising diffusion eigenvectors.
const PSI_FLOOR: f64 = 1e-10;
/// Lower bound on 1 − λ for multi-scale diffusion importances.
const SPECTRAL_GAP_FLOOR: f64 = 1e-10;
/// Relative tolerance for treating an affinity as already symmetric.
const SYMMETRY_TOL: f64 = 1e-10;

/// Projection kept by linear embeddings so new rows can be mapped.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearProjection {
    /// Column means subtracted before the SVD (zeros when not centring).
    pub mean: Array1<f64>,
    /// Right singular vectors, one column per component.
    pub basis: Array2<f64>,
}

impl LinearProjection {
    pub fn project(&self, rows: ArrayView2<f64>) -> GradientResult<Array2<f64>> {
        if rows.ncols() != self.mean.len() {
            return Err(GradientError::shape(
                "transform columns",
                self.mean.len(),
                rows.ncols(),
            ));
        }
        let centred = &rows - &self.mean.view().insert_axis(Axis(0));
        Ok(centred.dot(&self.basis))
    }
}

/// Result of one decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// n × k, one column per component.
    pub components: Array2<f64>,
    pub importances: Array1<f64>,
    /// Linear only: σᵢ² / Σσ².
    pub explained_variance_ratio: Option<Array1<f64>>,
    pub projection: Option<LinearProjection>,
}

impl Embedding {
    pub fn n_components(&self) -> usize {
        self.importances.len()
    }
}

/// Decompose an affinity matrix with the given approach.
///
/// The affinity must be square, finite and non-negative (the output of
/// `AffinityBuilder`). Stochastic solver steps draw from
/// `seeds.fork(streams::SOLVER)`.
pub fn embed(
    approach: &Approach,
    affinity: ArrayView2<f64>,
    n_components: usize,
    solver: Solver,
    seeds: &SeedStream,
) -> GradientResult<Embedding> {
    let (n, c) = affinity.dim();
    if n != c {
        return Err(GradientError::InvalidInput(format!(
            "affinity must be square, got {n}x{c}"
        )));
    }
    if n_components == 0 {
        return Err(GradientError::Config("n_components must be >= 1".to_string()));
    }
    let embedding = match *approach {
        Approach::Linear { center } => linear(affinity, n_components, center, solver, seeds)?,
        Approach::LaplacianEigenmap { normalized } => {
            laplacian_eigenmap(affinity, n_components, normalized, solver, seeds)?
        }
        Approach::DiffusionMap {
            alpha,
            diffusion_time,
        } => diffusion_map(affinity, n_components, alpha, diffusion_time, solver, seeds)?,
    };
    log::info!(
        "{approach} embedding: n={n}, k={}, leading importance={:.4e}",
        embedding.n_components(),
        embedding.importances.get(0).copied().unwrap_or(f64::NAN)
    );
    Ok(embedding)
}

fn subspace_options(solver: Solver) -> SubspaceOptions {
    match solver {
        Solver::Subspace {
            max_iter,
            tol,
            oversample,
        } => SubspaceOptions {
            max_iter,
            tol,
            oversample,
            iter_per_value: Solver::DEFAULT_ITER_PER_VALUE,
        },
        _ => SubspaceOptions::default(),
    }
}

fn iter_per_value(solver: Solver) -> usize {
    match solver {
        Solver::Dense { iter_per_value } => iter_per_value,
        _ => Solver::DEFAULT_ITER_PER_VALUE,
    }
}

fn check_graph_components(approach: &str, n: usize, k: usize) -> GradientResult<()> {
    if k + 1 > n {
        return Err(GradientError::InvalidInput(format!(
            "{approach} needs n_components <= n - 1, got {k} for n={n}"
        )));
    }
    Ok(())
}

// ── Linear ───────────────────────────────────────────────────────────

fn linear(
    a: ArrayView2<f64>,
    k: usize,
    center: bool,
    solver: Solver,
    seeds: &SeedStream,
) -> GradientResult<Embedding> {
    let (n, p) = a.dim();
    if k > n.min(p) {
        return Err(GradientError::InvalidInput(format!(
            "linear embedding needs n_components <= {}, got {k}",
            n.min(p)
        )));
    }
    let mean = if center {
        a.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p))
    } else {
        Array1::zeros(p)
    };
    let centred = &a - &mean.view().insert_axis(Axis(0));

    let (singular, mut basis) = match solver.resolve(n) {
        Solver::Subspace { .. } => {
            let mut rng = seeds.fork(streams::SOLVER);
            let eig = top_eigenpairs(
                p,
                k,
                |x| centred.t().dot(&centred.dot(&x)),
                &subspace_options(solver),
                &mut rng,
            )?;
            (eig.values.mapv(|v| v.max(0.0).sqrt()), eig.vectors)
        }
        resolved => {
            let svd = thin_svd(centred.view(), iter_per_value(resolved))?;
            (
                svd.s.slice(s![..k]).to_owned(),
                svd.v.slice(s![.., ..k]).to_owned(),
            )
        }
    };

    let mut components = centred.dot(&basis);
    for j in 0..k {
        if max_abs_is_negative(components.column(j)) {
            components.column_mut(j).mapv_inplace(|v| -v);
            basis.column_mut(j).mapv_inplace(|v| -v);
        }
    }

    let total: f64 = centred.iter().map(|v| v * v).sum();
    let explained = if total > 0.0 {
        singular.mapv(|s| s * s / total)
    } else {
        Array1::zeros(k)
    };

    Ok(Embedding {
        components,
        importances: singular,
        explained_variance_ratio: Some(explained),
        projection: Some(LinearProjection { mean, basis }),
    })
}

fn max_abs_is_negative(col: ndarray::ArrayView1<f64>) -> bool {
    let mut best = 0.0_f64;
    for &v in col {
        if v.abs() > best.abs() {
            best = v;
        }
    }
    best < 0.0
}

// ── Graph approaches ─────────────────────────────────────────────────

fn symmetric_affinity(a: ArrayView2<f64>, approach: &str) -> Array2<f64> {
    let w = if is_symmetric(a, SYMMETRY_TOL) {
        a.to_owned()
    } else {
        log::debug!("{approach}: symmetrising affinity");
        symmetrize_average(a)
    };
    if !is_connected(w.view()) {
        log::warn!("{approach}: affinity graph is not connected; embedding may be degenerate");
    }
    w
}

/// Gershgorin bound on the spectral radius.
fn spectral_bound(m: &Array2<f64>) -> f64 {
    m.rows()
        .into_iter()
        .map(|r| r.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Smallest,
    Largest,
}

/// `count` eigenpairs from one end of the spectrum of a symmetric matrix,
/// ordered from the extreme inwards.
fn extreme_eigenpairs(
    m: &Array2<f64>,
    count: usize,
    end: End,
    solver: Solver,
    seeds: &SeedStream,
) -> GradientResult<EigenDecomposition> {
    let n = m.nrows();
    match solver.resolve(n) {
        Solver::Subspace { .. } => {
            let c = spectral_bound(m);
            let mut rng = seeds.fork(streams::SOLVER);
            let opts = subspace_options(solver);
            let eig = match end {
                End::Smallest => top_eigenpairs(n, count, |x| &x * c - m.dot(&x), &opts, &mut rng)?,
                End::Largest => top_eigenpairs(n, count, |x| m.dot(&x) + &x * c, &opts, &mut rng)?,
            };
            let values = match end {
                End::Smallest => eig.values.mapv(|mu| c - mu),
                End::Largest => eig.values.mapv(|mu| mu - c),
            };
            Ok(EigenDecomposition {
                values,
                vectors: eig.vectors,
            })
        }
        resolved => {
            let full = symmetric_eigen(m.view(), iter_per_value(resolved))?;
            let full = match end {
                End::Smallest => full,
                End::Largest => full.reversed(),
            };
            Ok(EigenDecomposition {
                values: full.values.slice(s![..count]).to_owned(),
                vectors: full.vectors.slice(s![.., ..count]).to_owned(),
            })
        }
    }
}

fn laplacian_eigenmap(
    a: ArrayView2<f64>,
    k: usize,
    normalized: bool,
    solver: Solver,
    seeds: &SeedStream,
) -> GradientResult<Embedding> {
    let n = a.nrows();
    check_graph_components("laplacian eigenmap", n, k)?;
    let w = symmetric_affinity(a, "laplacian eigenmap");

    let (l, sqrt_d) = if normalized {
        let (l, sqrt_d) = normalized_laplacian(w.view());
        (l, Some(sqrt_d))
    } else {
        (laplacian(w.view()), None)
    };

    let eig = extreme_eigenpairs(&l, k + 1, End::Smallest, solver, seeds)?;
    let importances = eig.values.slice(s![1..]).mapv(|v| v.max(0.0));
    let mut components = eig.vectors.slice(s![.., 1..]).to_owned();
    if let Some(sqrt_d) = sqrt_d {
        let floor = DEGREE_FLOOR.sqrt();
        for (mut row, &sd) in components.rows_mut().into_iter().zip(sqrt_d.iter()) {
            let sd = sd.max(floor);
            row.mapv_inplace(|v| v / sd);
        }
    }
    sign_by_max_abs(&mut components);

    Ok(Embedding {
        components,
        importances,
        explained_variance_ratio: None,
        projection: None,
    })
}

fn diffusion_map(
    a: ArrayView2<f64>,
    k: usize,
    alpha: f64,
    diffusion_time: f64,
    solver: Solver,
    seeds: &SeedStream,
) -> GradientResult<Embedding> {
    let n = a.nrows();
    check_graph_components("diffusion map", n, k)?;
    let mut w = symmetric_affinity(a, "diffusion map");

    if alpha > 0.0 {
        let scale = degrees(w.view()).mapv(|d| d.max(DEGREE_FLOOR).powf(-alpha));
        for ((i, j), v) in w.indexed_iter_mut() {
            *v *= scale[i] * scale[j];
        }
    }
    let (transition, _) = normalized_adjacency(w.view());

    let eig = extreme_eigenpairs(&transition, k + 1, End::Largest, solver, seeds)?;

    let mut psi = eig.vectors;
    for mut row in psi.rows_mut() {
        let v0 = row[0];
        let denom = if v0.abs() < PSI_FLOOR {
            PSI_FLOOR.copysign(v0)
        } else {
            v0
        };
        row.mapv_inplace(|v| v / denom);
    }

    let lambdas = eig.values.slice(s![1..]).to_owned();
    let importances = if diffusion_time == 0.0 {
        lambdas.mapv(|l| l / (1.0 - l).max(SPECTRAL_GAP_FLOOR))
    } else {
        lambdas.mapv(|l| l.max(0.0).powf(diffusion_time))
    };

    let mut components = psi.slice(s![.., 1..]).to_owned();
    for (mut col, &imp) in components.columns_mut().into_iter().zip(importances.iter()) {
        col.mapv_inplace(|v| v * imp);
    }
    sign_by_max_abs(&mut components);

    Ok(Embedding {
        components,
        importances,
        explained_variance_ratio: None,
        projection: None,
    })
}
