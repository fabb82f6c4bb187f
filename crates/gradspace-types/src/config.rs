// ─────────────────────────────────────────────────────────────────────
// Gradspace — Configuration
// ─────────────────────────────────────────────────────────────────────
//! Configuration for the embedding pipeline and both null models.
//!
//! Every struct is serde-serialisable, carries the documented defaults and
//! exposes `validate()`; consumers call it before storing a config.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GradientError, GradientResult};

/// Matrices up to this size use the dense solver under `Solver::Auto`.
pub const DENSE_SOLVER_MAX_N: usize = 256;

// ── Embedding ────────────────────────────────────────────────────────

/// Decomposition applied to the affinity matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    /// PCA / SVD of the (optionally column-centred) affinity matrix.
    Linear { center: bool },
    /// Eigenvectors of the graph Laplacian with the smallest eigenvalues.
    LaplacianEigenmap { normalized: bool },
    /// Right eigenvectors of the (anisotropic) diffusion operator.
    ///
    /// `diffusion_time == 0` selects the multi-scale weighting λ/(1 − λ).
    DiffusionMap { alpha: f64, diffusion_time: f64 },
}

impl Approach {
    pub const fn linear() -> Self {
        Self::Linear { center: true }
    }

    pub const fn laplacian_eigenmap() -> Self {
        Self::LaplacianEigenmap { normalized: true }
    }

    pub const fn diffusion_map() -> Self {
        Self::DiffusionMap {
            alpha: 0.5,
            diffusion_time: 0.0,
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::LaplacianEigenmap { .. } => "laplacian_eigenmap",
            Self::DiffusionMap { .. } => "diffusion_map",
        }
    }
}

impl Default for Approach {
    fn default() -> Self {
        Self::diffusion_map()
    }
}

impl fmt::Display for Approach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Approach {
    type Err = GradientError;

    fn from_str(s: &str) -> GradientResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pca" | "linear" => Ok(Self::linear()),
            "le" | "laplacian_eigenmap" | "laplacian-eigenmap" => Ok(Self::laplacian_eigenmap()),
            "dm" | "diffusion_map" | "diffusion-map" => Ok(Self::diffusion_map()),
            other => Err(GradientError::Config(format!(
                "unknown approach '{other}' (expected pca, le or dm)"
            ))),
        }
    }
}

/// Kernel turning rows of the input matrix into pairwise affinities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    Pearson,
    Spearman,
    Cosine,
    NormalizedAngle,
    /// exp(−γ‖xᵢ − xⱼ‖²); γ defaults to 1 / n_features.
    Gaussian { gamma: Option<f64> },
    /// Pass-through: the input rows are the affinities.
    #[default]
    None,
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pearson => "pearson",
            Self::Spearman => "spearman",
            Self::Cosine => "cosine",
            Self::NormalizedAngle => "normalized_angle",
            Self::Gaussian { .. } => "gaussian",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Kernel {
    type Err = GradientError;

    fn from_str(s: &str) -> GradientResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pearson" => Ok(Self::Pearson),
            "spearman" => Ok(Self::Spearman),
            "cosine" => Ok(Self::Cosine),
            "normalized_angle" | "normalized-angle" => Ok(Self::NormalizedAngle),
            "gaussian" => Ok(Self::Gaussian { gamma: None }),
            "none" | "" => Ok(Self::None),
            other => Err(GradientError::Config(format!("unknown kernel '{other}'"))),
        }
    }
}

/// Per-row sparsification of the affinity matrix.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sparsity {
    #[default]
    KeepAll,
    /// Fraction of the smallest entries zeroed in each row (0.9 keeps the top 10 %).
    Fraction(f64),
    /// Number of largest entries kept in each row.
    Neighbors(usize),
}

impl Sparsity {
    /// Number of entries kept in a row of length `n` (always ≥ 1 for n ≥ 1).
    pub fn kept_per_row(&self, n: usize) -> usize {
        let k = match *self {
            Self::KeepAll => n,
            Self::Fraction(f) => ((1.0 - f) * n as f64).ceil() as usize,
            Self::Neighbors(k) => k,
        };
        k.clamp(1.min(n), n)
    }
}

/// How the sparsified affinity is made symmetric again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symmetrize {
    #[default]
    Average,
    Maximum,
    None,
}

/// Eigensolver selection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    /// Dense for n ≤ `DENSE_SOLVER_MAX_N`, subspace iteration above.
    #[default]
    Auto,
    /// `iter_per_value` bounds the implicit QR iterations at that many per eigenvalue.
    Dense { iter_per_value: usize },
    Subspace {
        max_iter: usize,
        tol: f64,
        oversample: usize,
    },
}

impl Solver {
    pub const DEFAULT_ITER_PER_VALUE: usize = 30;
    pub const DEFAULT_MAX_ITER: usize = 3000;
    pub const DEFAULT_TOL: f64 = 1e-8;
    pub const DEFAULT_OVERSAMPLE: usize = 10;

    pub const fn dense() -> Self {
        Self::Dense {
            iter_per_value: Self::DEFAULT_ITER_PER_VALUE,
        }
    }

    pub const fn subspace() -> Self {
        Self::Subspace {
            max_iter: Self::DEFAULT_MAX_ITER,
            tol: Self::DEFAULT_TOL,
            oversample: Self::DEFAULT_OVERSAMPLE,
        }
    }

    /// Resolve `Auto` for a problem of size `n`.
    pub fn resolve(&self, n: usize) -> Self {
        match self {
            Self::Auto if n <= DENSE_SOLVER_MAX_N => Self::dense(),
            Self::Auto => Self::subspace(),
            other => *other,
        }
    }
}

/// Configuration for `GradientMaps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Number of gradients to compute.
    pub n_components: usize,
    pub approach: Approach,
    pub kernel: Kernel,
    pub sparsity: Sparsity,
    pub symmetrize: Symmetrize,
    /// Sparsify the input rows before the kernel instead of the affinity.
    pub pre_sparsify: bool,
    pub solver: Solver,
    /// Seed for stochastic solver steps; `None` draws one per fit.
    pub random_seed: Option<u64>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            n_components: 10,
            approach: Approach::default(),
            kernel: Kernel::default(),
            sparsity: Sparsity::default(),
            symmetrize: Symmetrize::default(),
            pre_sparsify: false,
            solver: Solver::default(),
            random_seed: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> GradientResult<()> {
        if self.n_components == 0 {
            return Err(GradientError::Config(
                "n_components must be >= 1".to_string(),
            ));
        }
        match self.approach {
            Approach::DiffusionMap {
                alpha,
                diffusion_time,
            } => {
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(GradientError::Config(format!(
                        "alpha must be in [0, 1], got {alpha}"
                    )));
                }
                if !diffusion_time.is_finite() || diffusion_time < 0.0 {
                    return Err(GradientError::Config(format!(
                        "diffusion_time must be >= 0, got {diffusion_time}"
                    )));
                }
            }
            Approach::Linear { .. } | Approach::LaplacianEigenmap { .. } => {}
        }
        if let Kernel::Gaussian { gamma: Some(g) } = self.kernel {
            if !(g.is_finite() && g > 0.0) {
                return Err(GradientError::Config(format!(
                    "gaussian gamma must be > 0, got {g}"
                )));
            }
        }
        match self.sparsity {
            Sparsity::Fraction(f) if !(0.0..1.0).contains(&f) => {
                return Err(GradientError::Config(format!(
                    "sparsity fraction must be in [0, 1), got {f}"
                )));
            }
            Sparsity::Neighbors(0) => {
                return Err(GradientError::Config(
                    "sparsity neighbor count must be >= 1".to_string(),
                ));
            }
            _ => {}
        }
        match self.solver {
            Solver::Dense { iter_per_value: 0 } => {
                return Err(GradientError::Config("iter_per_value must be > 0".to_string()));
            }
            Solver::Subspace { max_iter, tol, .. } => {
                if max_iter == 0 {
                    return Err(GradientError::Config("max_iter must be > 0".to_string()));
                }
                if !(tol.is_finite() && tol > 0.0) {
                    return Err(GradientError::Config(format!(
                        "solver tol must be > 0, got {tol}"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> GradientResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| GradientError::Config(format!("JSON parse error: {e}")))
    }
}

// ── Null models ──────────────────────────────────────────────────────

/// Configuration for `SpinPermutations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    pub n_rep: usize,
    pub random_seed: Option<u64>,
    /// Draw an independent rotation for the right hemisphere.
    pub unpaired_rotation: bool,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            n_rep: 100,
            random_seed: None,
            unpaired_rotation: false,
        }
    }
}

impl SpinConfig {
    pub fn validate(&self) -> GradientResult<()> {
        if self.n_rep == 0 {
            return Err(GradientError::Config("n_rep must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> GradientResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| GradientError::Config(format!("JSON parse error: {e}")))
    }
}

/// Surrogate-generation procedure for Moran spectral randomization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoranProcedure {
    /// Independent sign flip of every eigenvector coefficient.
    #[default]
    Singleton,
    /// Random joint rotation of consecutive coefficient pairs.
    Pair,
}

impl FromStr for MoranProcedure {
    type Err = GradientError;

    fn from_str(s: &str) -> GradientResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "singleton" => Ok(Self::Singleton),
            "pair" => Ok(Self::Pair),
            other => Err(GradientError::Config(format!(
                "unknown procedure '{other}' (expected singleton or pair)"
            ))),
        }
    }
}

/// Which Moran eigenvectors are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoranSpectrum {
    /// Eigenvectors with |λ| ≥ tol.
    #[default]
    NonZero,
    /// Every eigenvector except the constant one.
    All,
}

impl FromStr for MoranSpectrum {
    type Err = GradientError;

    fn from_str(s: &str) -> GradientResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nonzero" | "non_zero" => Ok(Self::NonZero),
            "all" => Ok(Self::All),
            other => Err(GradientError::Config(format!("unknown spectrum '{other}'"))),
        }
    }
}

/// Configuration for `MoranRandomization`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoranConfig {
    pub n_rep: usize,
    pub procedure: MoranProcedure,
    /// Eigenvalues with magnitude below this are treated as zero.
    pub tol: f64,
    pub spectrum: MoranSpectrum,
    pub random_seed: Option<u64>,
    /// QR iteration budget per eigenvalue for the eigendecomposition.
    pub iter_per_value: usize,
}

impl Default for MoranConfig {
    fn default() -> Self {
        Self {
            n_rep: 100,
            procedure: MoranProcedure::default(),
            tol: 1e-6,
            spectrum: MoranSpectrum::default(),
            random_seed: None,
            iter_per_value: Solver::DEFAULT_ITER_PER_VALUE,
        }
    }
}

impl MoranConfig {
    pub fn validate(&self) -> GradientResult<()> {
        if self.n_rep == 0 {
            return Err(GradientError::Config("n_rep must be >= 1".to_string()));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(GradientError::Config(format!(
                "tol must be > 0, got {}",
                self.tol
            )));
        }
        if self.iter_per_value == 0 {
            return Err(GradientError::Config("iter_per_value must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> GradientResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| GradientError::Config(format!("JSON parse error: {e}")))
    }
}
