// ─────────────────────────────────────────────────────────────────────
// Gradspace — Procrustes Alignment
// ─────────────────────────────────────────────────────────────────────
//! Orthogonal Procrustes alignment of embeddings.
//!
//! Gradients from different subjects or sessions are only defined up to an
//! orthogonal transform (sign flips, rotations within degenerate
//! subspaces). `procrustes` finds the orthogonal R minimising
//! ‖source·R − target‖_F, `ProcrustesAlignment` aligns a batch either to a
//! fixed reference or iteratively to the batch mean.
//!
//! Rows holding NaN in either matrix (masked vertices) are ignored when
//! estimating R and stay NaN in the output.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use gradspace_spectral::thin_svd;
use gradspace_types::{GradientError, GradientResult, Solver};

/// Align `source` onto `target` with the best orthogonal transform.
pub fn procrustes(source: ArrayView2<f64>, target: ArrayView2<f64>) -> GradientResult<Array2<f64>> {
    if source.nrows() != target.nrows() {
        return Err(GradientError::shape(
            "procrustes target rows",
            source.nrows(),
            target.nrows(),
        ));
    }
    if source.ncols() != target.ncols() {
        return Err(GradientError::shape(
            "procrustes target columns",
            source.ncols(),
            target.ncols(),
        ));
    }
    let k = source.ncols();
    let mut cross = Array2::<f64>::zeros((k, k));
    let mut used = 0usize;
    for (s, t) in source.rows().into_iter().zip(target.rows()) {
        if s.iter().chain(t.iter()).all(|v| v.is_finite()) {
            for a in 0..k {
                for b in 0..k {
                    cross[[a, b]] += s[a] * t[b];
                }
            }
            used += 1;
        }
    }
    if used == 0 {
        return Err(GradientError::InvalidInput(
            "procrustes needs at least one fully finite row".to_string(),
        ));
    }
    let svd = thin_svd(cross.view(), Solver::DEFAULT_ITER_PER_VALUE)?;
    let rotation = svd.u.dot(&svd.v.t());
    Ok(source.dot(&rotation))
}

/// Batch alignment to a reference or to the iteratively refined mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcrustesAlignment {
    /// Refinement rounds when aligning to the mean.
    pub n_iter: usize,
}

impl Default for ProcrustesAlignment {
    fn default() -> Self {
        Self { n_iter: 10 }
    }
}

/// Output of `ProcrustesAlignment::align`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedEmbeddings {
    pub aligned: Vec<Array2<f64>>,
    /// Reference the batch was aligned to in the last round.
    pub reference: Array2<f64>,
}

impl ProcrustesAlignment {
    pub fn new(n_iter: usize) -> Self {
        Self { n_iter }
    }

    /// Align every embedding.
    ///
    /// With a `reference` a single pass is made. Without one the first
    /// embedding seeds the reference, which is then replaced by the mean of
    /// the aligned batch for `n_iter` rounds.
    pub fn align(
        &self,
        embeddings: &[Array2<f64>],
        reference: Option<ArrayView2<f64>>,
    ) -> GradientResult<AlignedEmbeddings> {
        let first = embeddings.first().ok_or_else(|| {
            GradientError::InvalidInput("no embeddings to align".to_string())
        })?;

        if let Some(reference) = reference {
            let aligned = embeddings
                .iter()
                .map(|e| procrustes(e.view(), reference))
                .collect::<GradientResult<Vec<_>>>()?;
            return Ok(AlignedEmbeddings {
                aligned,
                reference: reference.to_owned(),
            });
        }

        let mut reference = first.clone();
        let mut aligned = embeddings.to_vec();
        for round in 0..self.n_iter.max(1) {
            aligned = embeddings
                .iter()
                .map(|e| procrustes(e.view(), reference.view()))
                .collect::<GradientResult<Vec<_>>>()?;
            let mut mean = Array2::<f64>::zeros(first.dim());
            for a in &aligned {
                mean += a;
            }
            mean /= aligned.len() as f64;
            let shift = (&mean - &reference)
                .iter()
                .filter(|v| v.is_finite())
                .map(|v| v * v)
                .sum::<f64>()
                .sqrt();
            log::debug!("procrustes round {round}: reference shift {shift:.3e}");
            reference = mean;
        }
        Ok(AlignedEmbeddings { aligned, reference })
    }
}
