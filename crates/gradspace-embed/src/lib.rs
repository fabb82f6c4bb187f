// ─────────────────────────────────────────────────────────────────────
// Gradspace — Gradient Embedding
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Connectivity gradients: affinity construction, manifold embedding and
//! alignment.
//!
//! - `affinity`: kernels, sparsification, symmetrisation
//! - `approach`: linear (PCA), Laplacian eigenmap, diffusion map
//! - `gradient_maps`: the `GradientMaps` estimator
//! - `alignment`: orthogonal Procrustes for batches of embeddings

pub mod affinity;
pub mod alignment;
pub mod approach;
pub mod gradient_maps;

pub use affinity::{compute_kernel, AffinityBuilder};
pub use alignment::{procrustes, AlignedEmbeddings, ProcrustesAlignment};
pub use approach::{embed, Embedding, LinearProjection};
pub use gradient_maps::{FittedGradients, GradientMaps};
