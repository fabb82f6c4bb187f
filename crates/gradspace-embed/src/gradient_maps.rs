// ─────────────────────────────────────────────────────────────────────
// Gradspace — Gradient Maps
// ─────────────────────────────────────────────────────────────────────
//! Stateful gradient estimator: configure once, fit, then read results.
//!
//! `fit` runs affinity construction followed by the configured embedding
//! approach. Results are stored only when the whole pipeline succeeds, so
//! a failed fit leaves the previous state untouched.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use sprs::CsMat;

use gradspace_types::{
    check_mask, mask_indices, EmbeddingConfig, GradientError, GradientResult, SeedStream,
};

use crate::affinity::AffinityBuilder;
use crate::alignment::ProcrustesAlignment;
use crate::approach::{embed, Embedding};

/// Results of a successful fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedGradients {
    /// n × k gradients; rows of masked-out vertices are NaN.
    pub gradients: Array2<f64>,
    /// Importance of each gradient.
    pub lambdas: Array1<f64>,
    /// Linear approach only.
    pub explained_variance_ratio: Option<Array1<f64>>,
    /// Seed the solver streams were derived from.
    pub seed: u64,
    /// Gradients after Procrustes alignment (`fit_many` only).
    pub aligned: Option<Array2<f64>>,
    mask: Option<Vec<bool>>,
    embedding: Embedding,
}

impl FittedGradients {
    pub fn n_components(&self) -> usize {
        self.lambdas.len()
    }

    pub fn mask(&self) -> Option<&[bool]> {
        self.mask.as_deref()
    }
}

/// Gradient estimator.
#[derive(Debug, Clone)]
pub struct GradientMaps {
    config: EmbeddingConfig,
    builder: AffinityBuilder,
    fitted: Option<FittedGradients>,
}

impl GradientMaps {
    pub fn new(config: EmbeddingConfig) -> GradientResult<Self> {
        config.validate()?;
        Ok(Self {
            builder: AffinityBuilder::from_config(&config),
            config,
            fitted: None,
        })
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn fitted(&self) -> Option<&FittedGradients> {
        self.fitted.as_ref()
    }

    pub fn gradients(&self) -> Option<&Array2<f64>> {
        self.fitted.as_ref().map(|f| &f.gradients)
    }

    pub fn lambdas(&self) -> Option<&Array1<f64>> {
        self.fitted.as_ref().map(|f| &f.lambdas)
    }

    /// Fit gradients of a dense square matrix.
    pub fn fit(&mut self, matrix: ArrayView2<f64>) -> GradientResult<&FittedGradients> {
        let fitted = self.compute(matrix, None)?;
        Ok(self.fitted.insert(fitted))
    }

    /// Fit gradients of a sparse square matrix.
    pub fn fit_sparse(&mut self, matrix: &CsMat<f64>) -> GradientResult<&FittedGradients> {
        let dense = matrix.to_dense();
        self.fit(dense.view())
    }

    /// Fit on the vertices where `mask` is true.
    ///
    /// Excluded rows and columns are dropped before the affinity is built
    /// (they may hold NaN); their gradient rows are NaN.
    pub fn fit_masked(
        &mut self,
        matrix: ArrayView2<f64>,
        mask: &[bool],
    ) -> GradientResult<&FittedGradients> {
        let fitted = self.compute(matrix, Some(mask))?;
        Ok(self.fitted.insert(fitted))
    }

    /// Fit several matrices with the same configuration, optionally
    /// aligning the results. Does not touch the stored state.
    pub fn fit_many(
        &self,
        matrices: &[Array2<f64>],
        alignment: Option<&ProcrustesAlignment>,
        reference: Option<ArrayView2<f64>>,
    ) -> GradientResult<Vec<FittedGradients>> {
        let mut fits = matrices
            .iter()
            .map(|m| self.compute(m.view(), None))
            .collect::<GradientResult<Vec<_>>>()?;
        if let Some(alignment) = alignment {
            let gradients: Vec<Array2<f64>> = fits.iter().map(|f| f.gradients.clone()).collect();
            let out = alignment.align(&gradients, reference)?;
            for (fit, aligned) in fits.iter_mut().zip(out.aligned) {
                fit.aligned = Some(aligned);
            }
        }
        Ok(fits)
    }

    /// Project new rows onto the fitted linear components.
    ///
    /// Rows live in the same space as the rows of the fitted affinity
    /// matrix. Only the linear approach defines this mapping.
    pub fn transform(&self, rows: ArrayView2<f64>) -> GradientResult<Array2<f64>> {
        let fitted = self.fitted.as_ref().ok_or_else(|| {
            GradientError::UnsupportedOperation("transform called before fit".to_string())
        })?;
        match &fitted.embedding.projection {
            Some(projection) => projection.project(rows),
            None => Err(GradientError::UnsupportedOperation(format!(
                "transform is only defined for the linear approach, not {}",
                self.config.approach
            ))),
        }
    }

    fn compute(
        &self,
        matrix: ArrayView2<f64>,
        mask: Option<&[bool]>,
    ) -> GradientResult<FittedGradients> {
        let (n, c) = matrix.dim();
        if n != c {
            return Err(GradientError::InvalidInput(format!(
                "input matrix must be square, got {n}x{c}"
            )));
        }

        let (affinity, retained) = match mask {
            Some(mask) => {
                check_mask(mask, n, "gradient mask")?;
                let idx = mask_indices(mask);
                let reduced = matrix.select(Axis(0), &idx).select(Axis(1), &idx);
                (self.builder.build(reduced.view())?, Some(idx))
            }
            None => (self.builder.build(matrix)?, None),
        };

        let seeds = SeedStream::from_option(self.config.random_seed);
        let embedding = embed(
            &self.config.approach,
            affinity.view(),
            self.config.n_components,
            self.config.solver,
            &seeds,
        )?;

        let gradients = match &retained {
            Some(idx) => {
                let mut full = Array2::from_elem((n, embedding.n_components()), f64::NAN);
                for (row, &i) in idx.iter().enumerate() {
                    full.row_mut(i).assign(&embedding.components.row(row));
                }
                full
            }
            None => embedding.components.clone(),
        };

        Ok(FittedGradients {
            gradients,
            lambdas: embedding.importances.clone(),
            explained_variance_ratio: embedding.explained_variance_ratio.clone(),
            seed: seeds.seed(),
            aligned: None,
            mask: mask.map(<[bool]>::to_vec),
            embedding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use gradspace_types::{Approach, Kernel, Solver, Sparsity};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_symmetric(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut m = Array2::zeros((n, n));
        for i in 0..n {
            for j in i..n {
                let v = rng.gen::<f64>();
                m[[i, j]] = v;
                m[[j, i]] = v;
            }
        }
        m
    }

    fn config(approach: Approach, kernel: Kernel, k: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            n_components: k,
            approach,
            kernel,
            random_seed: Some(0),
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn test_pca_normalized_angle_is_reproducible() {
        let m = random_symmetric(100, 42);
        let cfg = config(Approach::linear(), Kernel::NormalizedAngle, 2);

        let mut first = GradientMaps::new(cfg.clone()).unwrap();
        let g1 = first.fit(m.view()).unwrap().gradients.clone();
        assert_eq!(g1.dim(), (100, 2));
        assert!(g1.iter().all(|v| v.is_finite()));

        let mut second = GradientMaps::new(cfg).unwrap();
        let g2 = second.fit(m.view()).unwrap().gradients.clone();
        assert_eq!(g1, g2);
    }

    #[test]
    fn test_every_approach_is_deterministic() {
        let m = random_symmetric(40, 7);
        for approach in [
            Approach::linear(),
            Approach::laplacian_eigenmap(),
            Approach::diffusion_map(),
        ] {
            let cfg = EmbeddingConfig {
                sparsity: Sparsity::Fraction(0.8),
                ..config(approach, Kernel::Cosine, 3)
            };
            let mut a = GradientMaps::new(cfg.clone()).unwrap();
            let mut b = GradientMaps::new(cfg).unwrap();
            let ga = a.fit(m.view()).unwrap().clone();
            let gb = b.fit(m.view()).unwrap().clone();
            assert_eq!(ga.gradients, gb.gradients, "{approach}");
            assert_eq!(ga.lambdas, gb.lambdas, "{approach}");
            assert_eq!(ga.gradients.dim(), (40, 3));
        }
    }

    #[test]
    fn test_diffusion_lambdas_are_contiguous() {
        let m = random_symmetric(30, 9);
        let cfg = EmbeddingConfig {
            solver: Solver::dense(),
            ..config(Approach::diffusion_map(), Kernel::NormalizedAngle, 3)
        };
        let mut gm = GradientMaps::new(cfg).unwrap();
        gm.fit(m.view()).unwrap();
        let lambdas = gm.lambdas().unwrap();
        assert!(lambdas.is_standard_layout());
        for w in lambdas.as_slice().unwrap().windows(2) {
            assert!(w[0] >= w[1] - 1e-12, "{lambdas:?}");
        }
        assert!(gm.gradients().unwrap().is_standard_layout());
    }

    #[test]
    fn test_subspace_solver_is_seeded() {
        let m = random_symmetric(30, 3);
        let cfg = EmbeddingConfig {
            solver: Solver::Subspace {
                max_iter: 500,
                tol: 1e-8,
                oversample: 30,
            },
            ..config(Approach::diffusion_map(), Kernel::NormalizedAngle, 2)
        };
        let mut a = GradientMaps::new(cfg.clone()).unwrap();
        let mut b = GradientMaps::new(cfg).unwrap();
        assert_eq!(
            a.fit(m.view()).unwrap().gradients,
            b.fit(m.view()).unwrap().gradients
        );
    }

    #[test]
    fn test_failed_fit_keeps_previous_state() {
        let m = random_symmetric(20, 1);
        let mut gm = GradientMaps::new(config(Approach::linear(), Kernel::Pearson, 2)).unwrap();
        let before = gm.fit(m.view()).unwrap().gradients.clone();

        let mut bad = m.clone();
        bad[[3, 4]] = f64::INFINITY;
        assert!(matches!(
            gm.fit(bad.view()),
            Err(GradientError::InvalidInput(_))
        ));
        assert_eq!(gm.gradients(), Some(&before));
    }

    #[test]
    fn test_non_square_rejected() {
        let mut gm = GradientMaps::new(EmbeddingConfig::default()).unwrap();
        let m = Array2::<f64>::zeros((5, 4));
        assert!(gm.fit(m.view()).is_err());
        assert!(!gm.is_fitted());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = EmbeddingConfig {
            n_components: 0,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            GradientMaps::new(cfg),
            Err(GradientError::Config(_))
        ));
    }

    #[test]
    fn test_transform_linear_matches_gradients() {
        let m = random_symmetric(25, 9);
        let mut gm = GradientMaps::new(config(Approach::linear(), Kernel::None, 3)).unwrap();
        let g = gm.fit(m.view()).unwrap().gradients.clone();
        let t = gm.transform(m.view()).unwrap();
        for (a, b) in t.iter().zip(g.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_transform_unsupported_for_graph_approaches() {
        let m = random_symmetric(15, 2);
        let mut gm =
            GradientMaps::new(config(Approach::diffusion_map(), Kernel::None, 2)).unwrap();
        gm.fit(m.view()).unwrap();
        assert!(matches!(
            gm.transform(m.view()),
            Err(GradientError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_transform_before_fit() {
        let gm = GradientMaps::new(config(Approach::linear(), Kernel::None, 1)).unwrap();
        assert!(gm.transform(Array2::zeros((2, 2)).view()).is_err());
    }

    #[test]
    fn test_masked_fit_leaves_nan_rows() {
        let mut m = random_symmetric(12, 5);
        for j in 0..12 {
            m[[4, j]] = f64::NAN;
            m[[j, 4]] = f64::NAN;
        }
        let mut mask = vec![true; 12];
        mask[4] = false;

        let mut gm =
            GradientMaps::new(config(Approach::laplacian_eigenmap(), Kernel::None, 2)).unwrap();
        let fitted = gm.fit_masked(m.view(), &mask).unwrap();
        assert!(fitted.gradients.row(4).iter().all(|v| v.is_nan()));
        for i in (0..12).filter(|&i| i != 4) {
            assert!(fitted.gradients.row(i).iter().all(|v| v.is_finite()));
        }
        assert_eq!(fitted.mask(), Some(mask.as_slice()));
    }

    #[test]
    fn test_mask_length_mismatch() {
        let m = random_symmetric(6, 1);
        let mut gm = GradientMaps::new(config(Approach::linear(), Kernel::None, 1)).unwrap();
        assert!(matches!(
            gm.fit_masked(m.view(), &[true; 5]),
            Err(GradientError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_fit_many_with_alignment() {
        let m1 = random_symmetric(20, 11);
        let m2 = random_symmetric(20, 12);
        let gm = GradientMaps::new(config(Approach::diffusion_map(), Kernel::Cosine, 2)).unwrap();
        let fits = gm
            .fit_many(&[m1, m2], Some(&ProcrustesAlignment::new(2)), None)
            .unwrap();
        assert_eq!(fits.len(), 2);
        for fit in &fits {
            assert_eq!(fit.aligned.as_ref().map(|a| a.dim()), Some((20, 2)));
        }
        assert!(!gm.is_fitted());
    }

    #[test]
    fn test_explained_variance_only_for_linear() {
        let m = random_symmetric(10, 4);
        let mut linear = GradientMaps::new(config(Approach::linear(), Kernel::None, 2)).unwrap();
        assert!(linear.fit(m.view()).unwrap().explained_variance_ratio.is_some());
        let mut le =
            GradientMaps::new(config(Approach::laplacian_eigenmap(), Kernel::None, 2)).unwrap();
        assert!(le.fit(m.view()).unwrap().explained_variance_ratio.is_none());
    }

    #[test]
    fn test_sparse_fit_matches_dense() {
        let m = random_symmetric(8, 6);
        let sparse = CsMat::csr_from_dense(m.view(), 0.0);
        let mut a = GradientMaps::new(config(Approach::linear(), Kernel::None, 2)).unwrap();
        let mut b = GradientMaps::new(config(Approach::linear(), Kernel::None, 2)).unwrap();
        assert_eq!(
            a.fit_sparse(&sparse).unwrap().gradients,
            b.fit(m.view()).unwrap().gradients
        );
    }

    #[test]
    fn test_random_seed_recorded() {
        let m = random_symmetric(6, 8);
        let cfg = EmbeddingConfig {
            random_seed: None,
            ..config(Approach::linear(), Kernel::None, 1)
        };
        let mut gm = GradientMaps::new(cfg).unwrap();
        let seed = gm.fit(m.view()).unwrap().seed;
        let replay = EmbeddingConfig {
            random_seed: Some(seed),
            ..gm.config().clone()
        };
        let mut again = GradientMaps::new(replay).unwrap();
        assert_eq!(
            again.fit(m.view()).unwrap().gradients,
            gm.gradients().cloned().unwrap()
        );
    }
}
