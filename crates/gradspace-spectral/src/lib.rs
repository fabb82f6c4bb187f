// ─────────────────────────────────────────────────────────────────────
// Gradspace — Spectral Numerics
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Eigensolvers and graph operators for the embedding and null-model crates.
//!
//! - `eigen`: dense symmetric eigendecomposition and SVD (nalgebra), seeded
//!   subspace iteration
//! - `laplacian`: degrees, symmetry/connectivity checks, Laplacian builders

pub mod eigen;
pub mod laplacian;

pub use eigen::{
    sign_by_max_abs, symmetric_eigen, thin_svd, top_eigenpairs, EigenDecomposition,
    SubspaceOptions, Svd,
};
pub use laplacian::{
    degrees, is_connected, is_symmetric, laplacian, normalized_adjacency, normalized_laplacian,
    symmetrize_average, DEGREE_FLOOR,
};
