// ─────────────────────────────────────────────────────────────────────
// Gradspace — PyO3 FFI Bindings
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
// Note: #[deny(unsafe_code)] not applied — PyO3 proc macros generate
// unsafe blocks internally. All hand-written code in this crate is safe.
//! Python-callable wrappers around the gradient and null-model engines.
//!
//! Exposes `GradientMaps`, `SpinPermutations` and `MoranRandomization`.
//! Matrices cross the boundary as lists of rows (`list[list[float]]`).
//!
//! # FFI Safety
//!
//! - Numeric work runs with the GIL released (`Python::allow_threads`).
//! - Estimators sit behind a `parking_lot::RwLock`: `fit` takes the write
//!   lock, reads and `randomize` share the read lock, so concurrent Python
//!   threads can randomize against one fitted state.
//! - Every `GradientError` becomes a `ValueError` with its message.
//!
//! Usage from Python:
//! ```python
//! from gradspace import GradientMaps, MoranRandomization
//!
//! gm = GradientMaps(n_components=2, approach="dm", kernel="normalized_angle",
//!                   random_seed=0)
//! gm.fit(connectivity)
//! msr = MoranRandomization(n_rep=1000, random_seed=0)
//! msr.fit(weights)
//! surrogates = msr.randomize(gm.gradients_column(0))
//! ```

use ndarray::Array2;
use parking_lot::RwLock;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use sprs::{CsMat, TriMat};

use gradspace_embed::GradientMaps;
use gradspace_null::{MoranRandomization, SpinPermutations};
use gradspace_types::{
    Approach, EmbeddingConfig, GradientError, Kernel, MoranConfig, MoranProcedure, MoranSpectrum,
    Sparsity, SpinConfig,
};

fn value_error(e: GradientError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn to_array2(rows: Vec<Vec<f64>>, what: &str) -> PyResult<Array2<f64>> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if let Some(i) = rows.iter().position(|r| r.len() != n_cols) {
        return Err(PyValueError::new_err(format!(
            "{what}: row {i} has {} values, expected {n_cols}",
            rows[i].len()
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| PyValueError::new_err(format!("{what}: {e}")))
}

fn to_rows(a: &Array2<f64>) -> Vec<Vec<f64>> {
    a.rows().into_iter().map(|r| r.to_vec()).collect()
}

fn triplets_to_csr(
    n: usize,
    rows: &[usize],
    cols: &[usize],
    values: &[f64],
) -> PyResult<CsMat<f64>> {
    if rows.len() != cols.len() || rows.len() != values.len() {
        return Err(PyValueError::new_err(format!(
            "triplet lengths differ: rows={}, cols={}, values={}",
            rows.len(),
            cols.len(),
            values.len()
        )));
    }
    let mut tri = TriMat::new((n, n));
    for ((&i, &j), &v) in rows.iter().zip(cols).zip(values) {
        if i >= n || j >= n {
            return Err(PyValueError::new_err(format!(
                "triplet ({i}, {j}) out of bounds for n={n}"
            )));
        }
        tri.add_triplet(i, j, v);
    }
    Ok(tri.to_csr())
}

// ─── GradientMaps ───────────────────────────────────────────────────

/// Connectivity gradients via PCA, Laplacian eigenmaps or diffusion maps.
#[pyclass(name = "GradientMaps")]
struct PyGradientMaps {
    inner: RwLock<GradientMaps>,
}

#[pymethods]
impl PyGradientMaps {
    #[new]
    #[pyo3(signature = (
        n_components = 10,
        approach = "dm",
        kernel = None,
        sparsity = None,
        random_seed = None,
    ))]
    fn new(
        n_components: usize,
        approach: &str,
        kernel: Option<&str>,
        sparsity: Option<f64>,
        random_seed: Option<u64>,
    ) -> PyResult<Self> {
        let config = EmbeddingConfig {
            n_components,
            approach: approach.parse::<Approach>().map_err(value_error)?,
            kernel: kernel
                .map(str::parse::<Kernel>)
                .transpose()
                .map_err(value_error)?
                .unwrap_or_default(),
            sparsity: sparsity.map_or(Sparsity::KeepAll, Sparsity::Fraction),
            random_seed,
            ..EmbeddingConfig::default()
        };
        let inner = GradientMaps::new(config).map_err(value_error)?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Construct from a JSON `EmbeddingConfig`.
    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let config = EmbeddingConfig::from_json(json).map_err(value_error)?;
        let inner = GradientMaps::new(config).map_err(value_error)?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Fit gradients; `mask` restricts the fit to vertices where it is true.
    #[pyo3(signature = (matrix, mask = None))]
    fn fit(
        &self,
        py: Python<'_>,
        matrix: Vec<Vec<f64>>,
        mask: Option<Vec<bool>>,
    ) -> PyResult<()> {
        let m = to_array2(matrix, "matrix")?;
        py.allow_threads(|| {
            let mut gm = self.inner.write();
            match &mask {
                Some(mask) => gm.fit_masked(m.view(), mask).map(|_| ()),
                None => gm.fit(m.view()).map(|_| ()),
            }
        })
        .map_err(value_error)
    }

    /// Fit gradients of a sparse matrix given as COO triplets.
    fn fit_sparse(
        &self,
        py: Python<'_>,
        n: usize,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
    ) -> PyResult<()> {
        let csr = triplets_to_csr(n, &rows, &cols, &values)?;
        py.allow_threads(|| self.inner.write().fit_sparse(&csr).map(|_| ()))
            .map_err(value_error)
    }

    /// Project rows onto the fitted linear components.
    fn transform(&self, py: Python<'_>, rows: Vec<Vec<f64>>) -> PyResult<Vec<Vec<f64>>> {
        let x = to_array2(rows, "rows")?;
        let out = py
            .allow_threads(|| self.inner.read().transform(x.view()))
            .map_err(value_error)?;
        Ok(to_rows(&out))
    }

    /// n × k gradients, or None before `fit`.
    #[getter]
    fn gradients(&self) -> Option<Vec<Vec<f64>>> {
        self.inner.read().gradients().map(to_rows)
    }

    /// Gradient `index` as a flat list.
    fn gradients_column(&self, index: usize) -> PyResult<Vec<f64>> {
        let gm = self.inner.read();
        let g = gm
            .gradients()
            .ok_or_else(|| PyValueError::new_err("gradients requested before fit"))?;
        if index >= g.ncols() {
            return Err(PyValueError::new_err(format!(
                "gradient {index} out of range (n_components={})",
                g.ncols()
            )));
        }
        Ok(g.column(index).to_vec())
    }

    #[getter]
    fn lambdas(&self) -> Option<Vec<f64>> {
        self.inner.read().lambdas().map(|l| l.to_vec())
    }

    #[getter]
    fn explained_variance_ratio(&self) -> Option<Vec<f64>> {
        self.inner
            .read()
            .fitted()
            .and_then(|f| f.explained_variance_ratio.as_ref())
            .map(|r| r.to_vec())
    }

    fn __repr__(&self) -> String {
        let gm = self.inner.read();
        let cfg = gm.config();
        format!(
            "GradientMaps(n_components={}, approach={}, kernel={}, fitted={})",
            cfg.n_components,
            cfg.approach,
            cfg.kernel,
            gm.is_fitted()
        )
    }
}

// ─── SpinPermutations ───────────────────────────────────────────────

/// Spin-test null model on spherical hemispheres.
#[pyclass(name = "SpinPermutations")]
struct PySpinPermutations {
    inner: RwLock<SpinPermutations>,
}

#[pymethods]
impl PySpinPermutations {
    #[new]
    #[pyo3(signature = (n_rep = 100, random_seed = None, unpaired_rotation = false))]
    fn new(n_rep: usize, random_seed: Option<u64>, unpaired_rotation: bool) -> PyResult<Self> {
        let inner = SpinPermutations::new(SpinConfig {
            n_rep,
            random_seed,
            unpaired_rotation,
        })
        .map_err(value_error)?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Fit rotations on sphere points (`list[[x, y, z]]` per hemisphere).
    #[pyo3(signature = (points_lh, points_rh = None))]
    fn fit(
        &self,
        py: Python<'_>,
        points_lh: Vec<[f64; 3]>,
        points_rh: Option<Vec<[f64; 3]>>,
    ) -> PyResult<()> {
        py.allow_threads(|| {
            self.inner
                .write()
                .fit(&points_lh, points_rh.as_deref())
                .map(|_| ())
        })
        .map_err(value_error)
    }

    /// Returns `(lh_surrogates, rh_surrogates or None)`, one row per repetition.
    #[pyo3(signature = (x_lh, x_rh = None))]
    #[allow(clippy::type_complexity)]
    fn randomize(
        &self,
        py: Python<'_>,
        x_lh: Vec<f64>,
        x_rh: Option<Vec<f64>>,
    ) -> PyResult<(Vec<Vec<f64>>, Option<Vec<Vec<f64>>>)> {
        let out = py
            .allow_threads(|| self.inner.read().randomize(&x_lh, x_rh.as_deref()))
            .map_err(value_error)?;
        Ok((to_rows(&out.lh), out.rh.as_ref().map(to_rows)))
    }

    /// Seed actually used by the last fit.
    #[getter]
    fn seed(&self) -> Option<u64> {
        self.inner.read().fitted().map(|f| f.seed)
    }
}

// ─── MoranRandomization ─────────────────────────────────────────────

/// Moran spectral randomization null model.
#[pyclass(name = "MoranRandomization")]
struct PyMoranRandomization {
    inner: RwLock<MoranRandomization>,
}

#[pymethods]
impl PyMoranRandomization {
    #[new]
    #[pyo3(signature = (
        n_rep = 100,
        procedure = "singleton",
        tol = 1e-6,
        spectrum = "nonzero",
        random_seed = None,
    ))]
    fn new(
        n_rep: usize,
        procedure: &str,
        tol: f64,
        spectrum: &str,
        random_seed: Option<u64>,
    ) -> PyResult<Self> {
        let config = MoranConfig {
            n_rep,
            procedure: procedure.parse::<MoranProcedure>().map_err(value_error)?,
            tol,
            spectrum: spectrum.parse::<MoranSpectrum>().map_err(value_error)?,
            random_seed,
            ..MoranConfig::default()
        };
        let inner = MoranRandomization::new(config).map_err(value_error)?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Fit on a dense weight matrix; `mask` excludes vertices where false.
    #[pyo3(signature = (weights, mask = None))]
    fn fit(
        &self,
        py: Python<'_>,
        weights: Vec<Vec<f64>>,
        mask: Option<Vec<bool>>,
    ) -> PyResult<()> {
        let w = to_array2(weights, "weights")?;
        py.allow_threads(|| {
            self.inner
                .write()
                .fit_dense(w.view(), mask.as_deref())
                .map(|_| ())
        })
        .map_err(value_error)
    }

    /// Fit on a sparse weight matrix given as COO triplets.
    fn fit_sparse(
        &self,
        py: Python<'_>,
        n: usize,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
    ) -> PyResult<()> {
        let csr = triplets_to_csr(n, &rows, &cols, &values)?;
        py.allow_threads(|| self.inner.write().fit(&csr).map(|_| ()))
            .map_err(value_error)
    }

    /// Surrogates of `x`, one row per repetition.
    #[pyo3(signature = (x, n_rep = None))]
    fn randomize(
        &self,
        py: Python<'_>,
        x: Vec<f64>,
        n_rep: Option<usize>,
    ) -> PyResult<Vec<Vec<f64>>> {
        let out = py
            .allow_threads(|| {
                let msr = self.inner.read();
                match n_rep {
                    Some(n_rep) => msr.randomize_with(&x, n_rep),
                    None => msr.randomize(&x),
                }
            })
            .map_err(value_error)?;
        Ok(to_rows(&out))
    }

    #[getter]
    fn moran_i(&self) -> Option<Vec<f64>> {
        self.inner.read().fitted().map(|f| f.moran_i.to_vec())
    }

    #[getter]
    fn eigenvalues(&self) -> Option<Vec<f64>> {
        self.inner.read().fitted().map(|f| f.eigenvalues.to_vec())
    }

    /// Moran eigenvectors as rows of vertices, or None before `fit`.
    #[getter]
    fn eigenvectors(&self) -> Option<Vec<Vec<f64>>> {
        self.inner.read().fitted().map(|f| to_rows(&f.vectors))
    }
}

// ─── Module Registration ────────────────────────────────────────────

/// Gradspace — connectivity gradients and spatial null models.
///
/// - `GradientMaps` — PCA / Laplacian eigenmap / diffusion map gradients
/// - `SpinPermutations` — spin-test surrogates on spheres
/// - `MoranRandomization` — Moran spectral randomization surrogates
#[pymodule]
fn gradspace(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyGradientMaps>()?;
    m.add_class::<PySpinPermutations>()?;
    m.add_class::<PyMoranRandomization>()?;
    Ok(())
}

