// ─────────────────────────────────────────────────────────────────────
// Gradspace — Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Error hierarchy, configuration, seeded random streams and geometry
//! collaborator traits shared by the Gradspace crates.

pub mod config;
pub mod error;
pub mod geometry;
pub mod rng;

pub use config::{
    Approach, EmbeddingConfig, Kernel, MoranConfig, MoranProcedure, MoranSpectrum, Solver,
    Sparsity, SpinConfig, Symmetrize, DENSE_SOLVER_MAX_N,
};
pub use error::{GradientError, GradientResult};
pub use geometry::{check_mask, finite_mask, mask_indices, Point3, SurfaceGeometry};
pub use rng::{streams, SeedStream};
